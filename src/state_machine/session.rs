use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::StateMachine;
use super::wrappers::system::SystemInput;

/// Lifecycle of one DDP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Protocol events driving the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// The caller asked to connect. Ignored while Connecting or Open.
    Connect,
    /// The transport reported open.
    TransportOpened,
    /// A `ping` arrived. `reply` is false when keep-alive answering is disabled.
    Ping { id: Option<Value>, reply: bool },
    /// A `pong` arrived.
    Pong,
    /// The caller asked to close.
    CloseRequested,
    /// The transport confirmed closure.
    TransportClosed,
    /// The transport reported an error.
    TransportFailed,
}

/// Work the session owner has to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    SendHandshake,
    SendPong(Option<Value>),
    /// Every pending correlated request must be failed with `Disconnected`.
    CancelPending,
}

/// Session state and liveness bookkeeping.
///
/// The current time is whatever instant was last fed in as [`SystemInput::System`]; the machine
/// never reads the clock itself.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    liveness_window: Duration,
    now: Option<Instant>,
    last_heartbeat: Option<Instant>,
    outputs: VecDeque<SessionOutput>,
}

impl SessionMachine {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            state: SessionState::Unconnected,
            liveness_window,
            now: None,
            last_heartbeat: None,
            outputs: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether `connect` may start a new transport session.
    ///
    /// Includes Closing, so a close the transport never confirms can be abandoned.
    pub fn can_connect(&self) -> bool {
        matches!(
            self.state,
            SessionState::Unconnected | SessionState::Closing | SessionState::Closed
        )
    }

    /// Open, and the last heartbeat is no older than the liveness window as of the last injected
    /// instant.
    pub fn is_alive(&self) -> bool {
        if self.state != SessionState::Open {
            return false;
        }

        match (self.last_heartbeat, self.now) {
            (Some(last), Some(now)) => now.saturating_duration_since(last) <= self.liveness_window,
            _ => false,
        }
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    fn tick(&mut self, now: Instant) {
        // Instants fed from several threads can arrive slightly out of order.
        if self.now.is_none_or(|current| now > current) {
            self.now = Some(now);
        }
    }

    fn touch(&mut self) {
        self.last_heartbeat = self.now;
    }

    fn connect(&mut self) {
        if self.can_connect() {
            self.state = SessionState::Connecting;
            self.last_heartbeat = None;
        }
    }

    fn transport_opened(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Open;
            self.touch();
            self.outputs.push_back(SessionOutput::SendHandshake);
        }
    }

    fn ping(&mut self, id: Option<Value>, reply: bool) {
        self.touch();
        if reply && self.state == SessionState::Open {
            self.outputs.push_back(SessionOutput::SendPong(id));
        }
    }

    fn close_requested(&mut self) {
        if matches!(self.state, SessionState::Connecting | SessionState::Open) {
            self.state = SessionState::Closing;
            self.outputs.push_back(SessionOutput::CancelPending);
        }
    }

    fn closed(&mut self) {
        if matches!(self.state, SessionState::Unconnected | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closed;
        self.outputs.push_back(SessionOutput::CancelPending);
    }
}

impl StateMachine for SessionMachine {
    type Input = SystemInput<SessionInput, Instant>;
    type Output = SessionOutput;

    fn process_input(&mut self, input: Self::Input) {
        let input = match input {
            SystemInput::System(now) => return self.tick(now),
            SystemInput::Input(input) => input,
        };

        match input {
            SessionInput::Connect => self.connect(),
            SessionInput::TransportOpened => self.transport_opened(),
            SessionInput::Ping { id, reply } => self.ping(id, reply),
            SessionInput::Pong => self.touch(),
            SessionInput::CloseRequested => self.close_requested(),
            SessionInput::TransportClosed | SessionInput::TransportFailed => self.closed(),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.outputs.pop_front()
    }
}
