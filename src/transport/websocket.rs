use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::{Transport, TransportHandler, TransportState};
use crate::error::DdpError;

/// Websocket transport built on `tokio-tungstenite`.
///
/// Each `open` spawns a reader task that feeds the handler and a writer task draining an
/// unbounded outbound channel, so `send` never waits on the socket. Must be opened from within a
/// tokio runtime.
///
/// After a `Close` frame is sent the peer has `close_timeout` to confirm it; otherwise the
/// connection is dropped and reported closed anyway.
#[derive(Clone)]
pub struct WebSocketTransport {
    link: Arc<Mutex<Link>>,
    close_timeout: Duration,
}

/// How long the peer gets to answer our `Close` frame.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

struct Link {
    state: TransportState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    handler: Option<Arc<dyn TransportHandler>>,
    close_requested: Arc<Notify>,
    // Bumped on every open so a task from an earlier connection can't touch a newer one.
    generation: u64,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            state: TransportState::Closed,
            outbound: None,
            handler: None,
            close_requested: Arc::new(Notify::new()),
            generation: 0,
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::with_close_timeout(DEFAULT_CLOSE_TIMEOUT)
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_close_timeout(close_timeout: Duration) -> Self {
        Self {
            link: Arc::new(Mutex::new(Link::default())),
            close_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link.lock().expect("websocket link lock poisoned")
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &Url, handler: Arc<dyn TransportHandler>) -> Result<(), DdpError> {
        let (generation, close_requested) = {
            let mut link = self.lock();
            if matches!(link.state, TransportState::Connecting | TransportState::Open) {
                return Err(DdpError::AlreadyConnecting);
            }
            link.state = TransportState::Connecting;
            link.handler = Some(Arc::clone(&handler));
            link.close_requested = Arc::new(Notify::new());
            link.generation += 1;
            (link.generation, Arc::clone(&link.close_requested))
        };

        tokio::spawn(run_connection(
            url.clone(),
            handler,
            Arc::clone(&self.link),
            Session {
                generation,
                close_requested,
                close_timeout: self.close_timeout,
            },
        ));

        Ok(())
    }

    fn send(&self, text: String) -> Result<(), DdpError> {
        let link = self.lock();
        match (&link.state, &link.outbound) {
            (TransportState::Open, Some(outbound)) => outbound
                .send(Message::text(text))
                .map_err(|_| DdpError::NotConnected),
            _ => Err(DdpError::NotConnected),
        }
    }

    fn close(&self) {
        let abandoned = {
            let mut link = self.lock();
            match link.state {
                TransportState::Open => {
                    link.state = TransportState::Closing;
                    if let Some(outbound) = &link.outbound {
                        let _ = outbound.send(Message::Close(None));
                    }
                    link.close_requested.notify_one();
                    None
                }
                // Still dialing; the connect task notices the state change and gives up.
                TransportState::Connecting => {
                    link.state = TransportState::Closed;
                    link.handler.take()
                }
                TransportState::Closing | TransportState::Closed => None,
            }
        };

        if let Some(handler) = abandoned {
            handler.on_closed();
        }
    }

    fn state(&self) -> TransportState {
        self.lock().state
    }
}

/// Per-open bookkeeping handed to the connection task.
struct Session {
    generation: u64,
    close_requested: Arc<Notify>,
    close_timeout: Duration,
}

async fn run_connection(
    url: Url,
    handler: Arc<dyn TransportHandler>,
    link: Arc<Mutex<Link>>,
    session: Session,
) {
    let generation = session.generation;

    debug!(url = %url, "Opening websocket");

    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(url = %url, error = %e, "Websocket connect failed");
            if finish(&link, generation) {
                handler.on_error(e.to_string());
            }
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    {
        let mut link = link.lock().expect("websocket link lock poisoned");
        if link.generation != generation || link.state != TransportState::Connecting {
            debug!(url = %url, "Websocket opened after close was requested, dropping it");
            return;
        }
        link.state = TransportState::Open;
        link.outbound = Some(outbound_tx);
    }

    info!(url = %url, "Websocket open");
    handler.on_open();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!(error = %e, "Websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let close_deadline = tokio::time::sleep(session.close_timeout);
    tokio::pin!(close_deadline);
    let mut closing = false;

    let failure = loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => handler.on_message(text.to_string()),
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Websocket closed by peer");
                    break None;
                }
                // Control frames are answered by tungstenite itself; binary frames aren't DDP.
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            },
            _ = session.close_requested.notified(), if !closing => {
                closing = true;
                close_deadline
                    .as_mut()
                    .reset(tokio::time::Instant::now() + session.close_timeout);
            }
            _ = &mut close_deadline, if closing => {
                warn!(
                    url = %url,
                    timeout_ms = session.close_timeout.as_millis() as u64,
                    "Peer never confirmed close, dropping the connection"
                );
                break None;
            }
        }
    };

    writer.abort();

    if !finish(&link, generation) {
        return;
    }

    match failure {
        Some(error) => {
            warn!(url = %url, error = %error, "Websocket failed");
            handler.on_error(error);
        }
        None => {
            info!(url = %url, "Websocket closed");
            handler.on_closed();
        }
    }
}

/// Mark the connection for `generation` closed. Returns `false` if a newer connection has
/// replaced it or it was already reported closed.
fn finish(link: &Mutex<Link>, generation: u64) -> bool {
    let mut link = link.lock().expect("websocket link lock poisoned");
    if link.generation != generation || link.handler.is_none() {
        return false;
    }
    link.state = TransportState::Closed;
    link.outbound = None;
    link.handler = None;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    struct Events(mpsc::UnboundedSender<&'static str>);

    impl TransportHandler for Events {
        fn on_open(&self) {
            let _ = self.0.send("open");
        }
        fn on_message(&self, _text: String) {
            let _ = self.0.send("message");
        }
        fn on_closed(&self) {
            let _ = self.0.send("closed");
        }
        fn on_error(&self, _error: String) {
            let _ = self.0.send("error");
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<&'static str>) -> &'static str {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no transport callback")
            .expect("handler dropped")
    }

    /// Accepts one websocket, sends a single frame, then never reads again.
    async fn unresponsive_server() -> (Url, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::text(r#"{"msg":"ping"}"#)).await.unwrap();
            std::future::pending::<()>().await;
            drop(ws);
        });

        let url = Url::parse(&format!("ws://{addr}/websocket")).unwrap();
        (url, server)
    }

    #[tokio::test]
    async fn test_unanswered_close_times_out() {
        let (url, server) = unresponsive_server().await;
        let transport = WebSocketTransport::with_close_timeout(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.open(&url, Arc::new(Events(tx))).unwrap();
        assert_eq!(next(&mut rx).await, "open");
        assert_eq!(next(&mut rx).await, "message");

        transport.close();
        assert_eq!(transport.state(), TransportState::Closing);

        assert_eq!(next(&mut rx).await, "closed");
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(matches!(
            transport.send("{}".to_string()),
            Err(DdpError::NotConnected)
        ));

        server.abort();
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = WebSocketTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = Url::parse(&format!("ws://{addr}/websocket")).unwrap();

        transport.open(&url, Arc::new(Events(tx))).unwrap();
        assert_eq!(next(&mut rx).await, "error");
        assert_eq!(transport.state(), TransportState::Closed);
    }
}
