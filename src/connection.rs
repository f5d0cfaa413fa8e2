use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::correlator::{Correlator, FrameSink};
use crate::delivery::DeliveryQueue;
use crate::error::DdpError;
use crate::protocol::{Heartbeat, OutboundFrame, encode, heartbeat, websocket_url};
use crate::state_machine::StateMachine;
use crate::state_machine::session::{SessionInput, SessionMachine, SessionOutput, SessionState};
use crate::state_machine::wrappers::system::SystemInput;
use crate::transport::{Transport, TransportHandler};

/// One DDP session over a [`Transport`].
///
/// The connection:
/// - Opens the transport and sends the `connect` handshake once it reports open
/// - Answers `ping` with `pong` on the receive path, before frames are queued
/// - Hands every other inbound frame to the [`DeliveryQueue`]
/// - Fails all pending correlated requests when the session closes
pub struct Connection<T: Transport> {
    shared: Arc<ConnectionShared<T>>,
}

struct ConnectionShared<T: Transport> {
    transport: T,
    config: ClientConfig,
    machine: Mutex<SessionMachine>,
    state_tx: watch::Sender<SessionState>,
    last_failure: Mutex<Option<String>>,
    // Bumped on every connect; callbacks from an earlier transport session are ignored.
    attempt: AtomicU64,
    correlator: Arc<Correlator>,
    queue: DeliveryQueue,
}

impl<T: Transport> Connection<T> {
    pub fn new(
        transport: T,
        config: ClientConfig,
        correlator: Arc<Correlator>,
        queue: DeliveryQueue,
    ) -> Self {
        let machine = SessionMachine::new(config.liveness_window);
        let (state_tx, _) = watch::channel(machine.state());

        Self {
            shared: Arc::new(ConnectionShared {
                transport,
                config,
                machine: Mutex::new(machine),
                state_tx,
                last_failure: Mutex::new(None),
                attempt: AtomicU64::new(0),
                correlator,
                queue,
            }),
        }
    }

    /// Open a session to `host`, returning once the handshake has been sent.
    ///
    /// Already open is a no-op. A connection attempt in flight is rejected with
    /// [`DdpError::AlreadyConnecting`]. A close the transport never confirmed is abandoned and a
    /// new transport session is opened.
    pub async fn connect(&self, host: &str, secure: bool) -> Result<(), DdpError> {
        let url = websocket_url(host, secure)?;

        let attempt = {
            let mut machine = self.shared.lock_machine();
            match machine.state() {
                SessionState::Open => return Ok(()),
                SessionState::Closing => {
                    warn!(url = %url, "Previous close was never confirmed, abandoning it");
                }
                _ if !machine.can_connect() => return Err(DdpError::AlreadyConnecting),
                _ => {}
            }
            self.shared.step(&mut machine, SessionInput::Connect);
            self.shared.attempt.fetch_add(1, Ordering::AcqRel) + 1
        };

        *self.shared.lock_failure() = None;
        self.shared.queue.start();

        let mut state_rx = self.shared.state_tx.subscribe();
        let handler: Arc<dyn TransportHandler> = Arc::new(SessionEvents {
            shared: Arc::downgrade(&self.shared),
            attempt,
        });

        info!(url = %url, "Connecting to DDP server");

        if let Err(e) = self.shared.transport.open(&url, handler) {
            warn!(url = %url, error = %e, "Transport refused to open");
            self.shared.apply(SessionInput::TransportFailed);
            return Err(e);
        }

        let opened = tokio::time::timeout(
            self.shared.config.connect_timeout,
            state_rx.wait_for(|state| *state != SessionState::Connecting),
        )
        .await
        .map(|changed| changed.map(|state| *state));

        match opened {
            Ok(Ok(SessionState::Open)) => Ok(()),
            Ok(Ok(state)) => {
                let reason = self
                    .shared
                    .lock_failure()
                    .clone()
                    .unwrap_or_else(|| format!("session {state} before it opened"));
                Err(DdpError::TransportFailure(reason))
            }
            Ok(Err(_)) => Err(DdpError::Disconnected),
            Err(elapsed) => {
                warn!(
                    url = %url,
                    timeout_secs = %self.shared.config.connect_timeout.as_secs(),
                    "Timed out waiting for the transport to open"
                );
                self.close();
                Err(DdpError::Timeout(elapsed))
            }
        }
    }

    /// Send a pre-encoded frame verbatim.
    pub fn send(&self, text: String) -> Result<(), DdpError> {
        if self.state() != SessionState::Open {
            return Err(DdpError::NotConnected);
        }
        self.shared.transport.send(text)
    }

    /// Close the session. Pending correlated requests fail with [`DdpError::Disconnected`].
    pub fn close(&self) {
        let state = self.shared.apply(SessionInput::CloseRequested);
        if state == SessionState::Closing {
            info!("Closing DDP session");
            self.shared.transport.close();
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock_machine().state()
    }

    /// Watch the session state.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Open, with a heartbeat seen within the liveness window.
    pub fn is_alive(&self) -> bool {
        let mut machine = self.shared.lock_machine();
        machine.process_input(SystemInput::now());
        machine.is_alive()
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.shared.lock_machine().last_heartbeat()
    }
}

impl<T: Transport> FrameSink for Connection<T> {
    fn send_frame(&self, text: String) -> Result<(), DdpError> {
        self.send(text)
    }
}

impl<T: Transport> ConnectionShared<T> {
    fn lock_machine(&self) -> MutexGuard<'_, SessionMachine> {
        self.machine.lock().expect("session machine lock poisoned")
    }

    fn lock_failure(&self) -> MutexGuard<'_, Option<String>> {
        self.last_failure.lock().expect("failure lock poisoned")
    }

    /// Feed `input` to the session machine and carry out what it asks for.
    fn apply(&self, input: SessionInput) -> SessionState {
        let mut machine = self.lock_machine();
        self.step(&mut machine, input)
    }

    /// Frames the machine asks for are sent while the machine lock is held, so a handshake is on
    /// the wire before anyone can observe the session as open.
    fn step(&self, machine: &mut SessionMachine, input: SessionInput) -> SessionState {
        machine.process_input(SystemInput::now());
        machine.process_input(SystemInput::Input(input));

        let mut cancel = false;
        while let Some(output) = machine.poll_output() {
            match output {
                SessionOutput::SendHandshake => self.send_handshake(),
                SessionOutput::SendPong(id) => self.send_pong(id.as_ref()),
                SessionOutput::CancelPending => cancel = true,
            }
        }

        let state = machine.state();
        self.state_tx.send_replace(state);

        if cancel {
            let cancelled = self.correlator.cancel_all();
            if cancelled > 0 {
                info!(cancelled, "Failed pending requests on disconnect");
            }
        }

        state
    }

    fn send_handshake(&self) {
        let frame = OutboundFrame::Connect {
            version: &self.config.protocol_version,
            support: &self.config.supported_versions,
        };

        match encode(&frame).and_then(|text| self.transport.send(text)) {
            Ok(()) => debug!(version = %self.config.protocol_version, "Sent connect handshake"),
            Err(e) => warn!(error = %e, "Failed to send connect handshake"),
        }
    }

    fn send_pong(&self, id: Option<&Value>) {
        let result = encode(&OutboundFrame::Pong { id }).and_then(|text| self.transport.send(text));
        if let Err(e) = result {
            warn!(error = %e, "Failed to answer ping");
        }
    }

    fn on_message(&self, text: String) {
        match heartbeat(&text) {
            Some(Heartbeat::Ping { id }) if self.config.keep_alive => {
                self.apply(SessionInput::Ping { id, reply: true });
            }
            Some(Heartbeat::Ping { id }) => {
                self.apply(SessionInput::Ping { id, reply: false });
                self.queue.enqueue(text);
            }
            Some(Heartbeat::Pong) => {
                self.apply(SessionInput::Pong);
            }
            None => self.queue.enqueue(text),
        }
    }
}

impl<T: Transport> Drop for ConnectionShared<T> {
    fn drop(&mut self) {
        self.queue.shutdown();
        self.transport.close();
    }
}

/// The connection's side of the transport callbacks.
///
/// Holds the connection weakly; the transport must not keep a dropped client alive.
struct SessionEvents<T: Transport> {
    shared: Weak<ConnectionShared<T>>,
    attempt: u64,
}

impl<T: Transport> SessionEvents<T> {
    /// The connection, unless it is gone or has moved on to a newer transport session.
    fn current(&self) -> Option<Arc<ConnectionShared<T>>> {
        let shared = self.shared.upgrade()?;
        if shared.attempt.load(Ordering::Acquire) != self.attempt {
            debug!(attempt = self.attempt, "Ignoring callback from a stale transport session");
            return None;
        }
        Some(shared)
    }
}

impl<T: Transport> TransportHandler for SessionEvents<T> {
    fn on_open(&self) {
        if let Some(shared) = self.current() {
            shared.apply(SessionInput::TransportOpened);
            info!("DDP session open");
        }
    }

    fn on_message(&self, text: String) {
        if let Some(shared) = self.current() {
            shared.on_message(text);
        }
    }

    fn on_closed(&self) {
        if let Some(shared) = self.current() {
            shared.apply(SessionInput::TransportClosed);
            info!("DDP session closed");
        }
    }

    fn on_error(&self, error: String) {
        if let Some(shared) = self.current() {
            warn!(error = %error, "DDP transport failed");
            *shared.lock_failure() = Some(error);
            shared.apply(SessionInput::TransportFailed);
        }
    }
}
