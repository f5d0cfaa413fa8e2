use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::auth::{login_token, password_login_params, token_login_params};
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::correlator::{Correlator, PendingReply};
use crate::delivery::DeliveryQueue;
use crate::dispatcher::Dispatcher;
use crate::error::DdpError;
use crate::events::{DdpEvent, EventHub, EventStream, ListenerId};
use crate::request_id::RequestId;
use crate::state_machine::session::SessionState;
use crate::transport::{Transport, WebSocketTransport};

/// Host and transport security of the last `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    secure: bool,
}

/// A DDP client.
///
/// The client handles:
/// - Connecting, resuming and disconnecting one session
/// - Logging in by password digest or resume token
/// - Method calls, fire-and-forget or awaited
/// - Subscriptions, resolved when the server reports them ready
/// - Fan-out of collection mutations and uncorrelated messages to listeners
///
/// # Example
///
/// ```ignore
/// use ddp_client::{ClientConfig, DdpClient, DdpEvent};
/// use futures::StreamExt;
///
/// let client = DdpClient::new(ClientConfig::default());
/// client.connect("localhost:3000", false).await?;
/// client.login_with_password("alice", "secret").await?;
///
/// let mut events = client.events();
/// client.subscribe("items", &[])?.await?;
///
/// while let Some(event) = events.next().await {
///     if let DdpEvent::Added(item) = event {
///         println!("{} added to {}", item.id, item.collection);
///     }
/// }
/// ```
pub struct DdpClient<T: Transport = WebSocketTransport> {
    connection: Connection<T>,
    correlator: Arc<Correlator>,
    events: Arc<EventHub>,
    config: ClientConfig,
    endpoint: Mutex<Option<Endpoint>>,
    session_token: Mutex<Option<String>>,
}

impl DdpClient<WebSocketTransport> {
    /// Create a client that talks websocket.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(WebSocketTransport::new(), config)
    }
}

impl<T: Transport> DdpClient<T> {
    /// Create a client over `transport`.
    pub fn with_transport(transport: T, config: ClientConfig) -> Self {
        let correlator = Arc::new(Correlator::new());
        let events = Arc::new(EventHub::new());

        let dispatcher = Dispatcher::new(Arc::clone(&correlator), Arc::clone(&events));
        let queue = DeliveryQueue::new(move |frame| {
            dispatcher.dispatch_raw(&frame);
        });

        Self {
            connection: Connection::new(transport, config.clone(), Arc::clone(&correlator), queue),
            correlator,
            events,
            config,
            endpoint: Mutex::new(None),
            session_token: Mutex::new(None),
        }
    }

    /// Connect to the server at `host` (e.g. `localhost:3000`).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * `host` does not form a valid websocket URL
    /// * A connection attempt is already in progress
    /// * The transport failed or did not open within the connect timeout
    ///
    /// The host is remembered for [`resume`](Self::resume) only if it was actually dialled.
    pub async fn connect(&self, host: &str, secure: bool) -> Result<(), DdpError> {
        let was_open = self.connection.state() == SessionState::Open;
        let result = self.connection.connect(host, secure).await;

        match &result {
            Ok(()) if was_open => {}
            Err(DdpError::InvalidAddress(_) | DdpError::AlreadyConnecting) => {}
            _ => {
                *self.endpoint.lock().expect("endpoint lock poisoned") = Some(Endpoint {
                    host: host.to_string(),
                    secure,
                });
            }
        }

        result
    }

    /// Reconnect to the last host and log in with a resume `token`.
    ///
    /// Fails with [`DdpError::NotConnected`] if no `connect` was ever attempted.
    pub async fn resume(&self, token: &str) -> Result<Value, DdpError> {
        let endpoint = self
            .endpoint
            .lock()
            .expect("endpoint lock poisoned")
            .clone()
            .ok_or(DdpError::NotConnected)?;

        info!(host = %endpoint.host, secure = endpoint.secure, "Resuming DDP session");

        self.connection.connect(&endpoint.host, endpoint.secure).await?;
        self.login_with_token(token).await
    }

    /// Call `login` with caller-shaped parameters.
    ///
    /// A `token` in the result is remembered; see [`session_token`](Self::session_token).
    pub async fn login(&self, params: Value) -> Result<Value, DdpError> {
        let result = self.call_with_result("login", &[params]).await?;

        if let Some(token) = login_token(&result) {
            debug!("Stored login resume token");
            *self.session_token.lock().expect("token lock poisoned") = Some(token.to_string());
        }

        Ok(result)
    }

    /// Log in with a username and a SHA-256 digest of `password`.
    pub async fn login_with_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Value, DdpError> {
        self.login(password_login_params(username, password)).await
    }

    /// Log in with a resume token.
    pub async fn login_with_token(&self, token: &str) -> Result<Value, DdpError> {
        self.login(token_login_params(token)).await
    }

    /// Call a method without waiting for it.
    ///
    /// The `result` frame is not correlated and reaches the listeners as a
    /// [`DdpEvent::Message`].
    pub fn call(&self, method: &str, params: &[Value]) -> Result<RequestId, DdpError> {
        self.correlator
            .notify_method(&self.connection, method, params)
    }

    /// Call a method and return a handle resolving with its result.
    pub fn call_pending(&self, method: &str, params: &[Value]) -> Result<PendingReply, DdpError> {
        self.correlator
            .call_method(&self.connection, method, params)
    }

    /// Call a method and wait for its result, at most the configured call timeout if one is set.
    pub async fn call_with_result(
        &self,
        method: &str,
        params: &[Value],
    ) -> Result<Value, DdpError> {
        let reply = self.call_pending(method, params)?;

        match self.config.call_timeout {
            Some(timeout) => reply.with_timeout(timeout).await,
            None => reply.await,
        }
    }

    /// Subscribe to a publication.
    ///
    /// Send failures are returned immediately. The handle resolves with the `ready` frame listing
    /// the subscription, or fails with [`DdpError::SubscriptionRejected`].
    pub fn subscribe(&self, name: &str, params: &[Value]) -> Result<PendingReply, DdpError> {
        self.correlator
            .subscribe(&self.connection, name, params)
    }

    /// Close the session. Pending requests fail with [`DdpError::Disconnected`].
    pub fn disconnect(&self) {
        self.connection.close();
    }

    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }

    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.connection.watch_state()
    }

    /// The most recently issued request id.
    pub fn last_request_id(&self) -> Option<u64> {
        self.correlator.last_request_id()
    }

    /// The resume token from the last successful login.
    pub fn session_token(&self) -> Option<String> {
        self.session_token
            .lock()
            .expect("token lock poisoned")
            .clone()
    }

    /// Register `listener` for every event until removed.
    ///
    /// Listeners run on the delivery worker and should return quickly.
    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DdpEvent) + Send + Sync + 'static,
    {
        self.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: &ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    /// Stream of every event from now on.
    pub fn events(&self) -> EventStream {
        self.events.stream()
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password_digest;
    use crate::transport::MemoryTransport;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn client() -> (MemoryTransport, DdpClient<MemoryTransport>) {
        let transport = MemoryTransport::new();
        let client = DdpClient::with_transport(transport.clone(), ClientConfig::default());
        (transport, client)
    }

    /// Wait until the client has sent `count` frames.
    async fn sent_frames(transport: &MemoryTransport, count: usize) -> Vec<Value> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let sent = transport.sent_json();
                if sent.len() >= count {
                    return sent;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("frame was never sent")
    }

    async fn next_event(events: &mut EventStream) -> DdpEvent {
        tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("no event")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_password_login_round_trip() {
        let (transport, client) = client();
        client.connect("localhost:3000", false).await.unwrap();

        let server = async {
            let sent = sent_frames(&transport, 2).await;
            assert_eq!(
                sent[1],
                json!({
                    "msg": "method",
                    "method": "login",
                    "params": [{
                        "user": {"username": "a"},
                        "password": {"digest": password_digest("b"), "algorithm": "sha-256"},
                    }],
                    "id": "1",
                })
            );
            transport.deliver_json(&json!({"msg": "result", "id": "1", "result": {"token": "t"}}));
        };

        let (result, ()) = tokio::join!(client.login_with_password("a", "b"), server);

        assert_eq!(result.unwrap(), json!({"token": "t"}));
        assert_eq!(client.session_token().as_deref(), Some("t"));
        assert_eq!(client.last_request_id(), Some(1));
    }

    #[tokio::test]
    async fn test_login_error_propagates() {
        let (transport, client) = client();
        client.connect("localhost:3000", false).await.unwrap();

        let server = async {
            sent_frames(&transport, 2).await;
            transport.deliver_json(&json!({
                "msg": "result",
                "id": "1",
                "error": {"error": 403, "reason": "Incorrect password"},
            }));
        };

        let (result, ()) = tokio::join!(client.login_with_token("stale"), server);

        assert!(matches!(result, Err(DdpError::Method(e)) if e.error == json!(403)));
        assert!(client.session_token().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_ready_then_added() {
        let (transport, client) = client();
        client.connect("localhost:3000", false).await.unwrap();
        let mut events = client.events();

        client.call("warmup", &[]).unwrap();
        let sub = client.subscribe("items", &[]).unwrap();

        let sent = transport.sent_json();
        assert_eq!(
            sent[2],
            json!({"msg": "sub", "name": "items", "params": [], "id": "2"})
        );

        transport.deliver_json(&json!({"msg": "ready", "subs": ["2"]}));
        transport.deliver_json(&json!({
            "msg": "added", "id": "i1", "collection": "items", "fields": {"x": 1}
        }));

        sub.await.unwrap();
        match next_event(&mut events).await {
            DdpEvent::Added(item) => {
                assert_eq!(item.id, "i1");
                assert_eq!(item.collection, "items");
                assert_eq!(item.fields["x"], json!(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fire_and_forget_result_is_a_message() {
        let (transport, client) = client();
        client.connect("localhost:3000", false).await.unwrap();
        let mut events = client.events();

        let id = client.call("ping_server", &[json!(1)]).unwrap();
        transport.deliver_json(&json!({"msg": "result", "id": id.as_str(), "result": 2}));

        assert_eq!(
            next_event(&mut events).await,
            DdpEvent::Message(json!({"msg": "result", "id": "1", "result": 2}))
        );
    }

    #[tokio::test]
    async fn test_heartbeat_never_reaches_listeners() {
        let (transport, client) = client();
        client.connect("localhost:3000", false).await.unwrap();
        let mut events = client.events();

        transport.deliver(r#"{"msg":"ping"}"#);
        transport.deliver(r#"{"msg":"nosuchthing"}"#);

        assert_eq!(transport.sent_json()[1], json!({"msg": "pong"}));
        assert_eq!(
            next_event(&mut events).await,
            DdpEvent::Message(json!({"msg": "nosuchthing"}))
        );
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_ignores_late_results() {
        let (transport, client) = client();
        client.connect("localhost:3000", false).await.unwrap();
        let mut events = client.events();

        let replies: Vec<_> = (0..4)
            .map(|_| client.call_pending("slow", &[]).unwrap())
            .collect();

        client.disconnect();
        assert_eq!(client.state(), SessionState::Closed);
        for reply in replies {
            assert!(matches!(reply.await, Err(DdpError::Disconnected)));
        }

        assert!(matches!(
            client.call("after", &[]),
            Err(DdpError::NotConnected)
        ));

        // Late frames are dropped by the closed transport; nothing is emitted.
        transport.deliver_json(&json!({"msg": "result", "id": "1", "result": null}));
        assert!(
            tokio::time::timeout(Duration::from_millis(20), events.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_call_timeout_applies() {
        let transport = MemoryTransport::new();
        let config = ClientConfig::builder()
            .call_timeout(Duration::from_millis(10))
            .build();
        let client = DdpClient::with_transport(transport, config);
        client.connect("localhost:3000", false).await.unwrap();

        let result = client.call_with_result("slow", &[]).await;
        assert!(matches!(result, Err(DdpError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_resume_reconnects_and_logs_in() {
        let (transport, client) = client();

        assert!(matches!(
            client.resume("t").await,
            Err(DdpError::NotConnected)
        ));

        client.connect("example.com", true).await.unwrap();
        client.disconnect();

        let server = async {
            let sent = sent_frames(&transport, 3).await;
            assert_eq!(sent[1]["msg"], "connect");
            assert_eq!(sent[2]["params"], json!([{"resume": "t"}]));
            transport.deliver_json(&json!({
                "msg": "result", "id": sent[2]["id"], "result": {"token": "t2"}
            }));
        };

        let (result, ()) = tokio::join!(client.resume("t"), server);
        result.unwrap();

        assert_eq!(transport.opened_urls()[1].as_str(), "wss://example.com/websocket");
        assert_eq!(client.session_token().as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn test_rejected_connect_keeps_last_endpoint() {
        let (transport, client) = client();

        client.connect("good.example:3000", false).await.unwrap();
        // Already open, so nothing is dialled.
        client.connect("other.example:3000", false).await.unwrap();
        assert!(matches!(
            client.connect("not a host", true).await,
            Err(DdpError::InvalidAddress(_))
        ));
        client.disconnect();

        let server = async {
            let sent = sent_frames(&transport, 3).await;
            transport.deliver_json(&json!({"msg": "result", "id": sent[2]["id"], "result": {}}));
        };
        let (result, ()) = tokio::join!(client.resume("t"), server);
        result.unwrap();

        let urls = transport.opened_urls();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[1].as_str(), "ws://good.example:3000/websocket");
    }

    #[tokio::test]
    async fn test_listener_registration_and_removal() {
        let (transport, client) = client();
        client.connect("localhost:3000", false).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let id = client.on_event(move |event| {
            let _ = tx.send(event.clone());
        });

        transport.deliver_json(&json!({"msg": "removed", "id": "i1", "collection": "items"}));
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            DdpEvent::Removed {
                id: "i1".to_string(),
                collection: "items".to_string()
            }
        );

        assert!(client.remove_listener(&id));
        assert!(!client.remove_listener(&id));
    }
}
