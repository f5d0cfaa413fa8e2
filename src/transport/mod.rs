//! # transport
//!
//! The narrow capability the session needs from whatever carries text frames to the server.
//!
//! A [`Transport`] opens, sends, closes and reports its state. Everything it observes is reported
//! back through a [`TransportHandler`] registered at open time. The session never inspects
//! framing, only the text payloads.
//!
//! Two implementations ship with the crate:
//! - [`WebSocketTransport`]: `tokio-tungstenite` client for real servers.
//! - [`MemoryTransport`]: in-process loopback for tests and embedding.

mod memory;
mod websocket;

pub use memory::MemoryTransport;
pub use websocket::{DEFAULT_CLOSE_TIMEOUT, WebSocketTransport};

use std::sync::Arc;

use url::Url;

use crate::error::DdpError;

/// Coarse connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Receives everything a transport observes.
///
/// Callbacks run on the transport's receive path and must not block.
pub trait TransportHandler: Send + Sync {
    /// The connection is open and frames may be sent.
    fn on_open(&self);

    /// One text frame arrived.
    fn on_message(&self, text: String);

    /// The connection closed, either on request or by the peer.
    fn on_closed(&self);

    /// The connection failed. No further callbacks follow.
    fn on_error(&self, error: String);
}

/// A message-oriented connection carrying text frames.
pub trait Transport: Send + Sync + 'static {
    /// Begin opening a connection to `url`.
    ///
    /// Returns once the attempt has started; the outcome is reported to `handler`.
    fn open(&self, url: &Url, handler: Arc<dyn TransportHandler>) -> Result<(), DdpError>;

    /// Send one text frame verbatim.
    fn send(&self, text: String) -> Result<(), DdpError>;

    /// Request shutdown. Confirmation arrives through [`TransportHandler::on_closed`].
    fn close(&self);

    fn state(&self) -> TransportState;
}
