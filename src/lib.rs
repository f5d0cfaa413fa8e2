//! Client for DDP, the JSON-over-websocket publish/subscribe and remote method protocol.
//!
//! Frames arriving from the [`transport`] pass through the heartbeat filter in [`connection`],
//! are queued in arrival order by [`delivery`], and are routed by [`dispatcher`] either to the
//! [`correlator`], which completes pending calls and subscriptions, or to the listeners
//! registered on [`events`]. [`DdpClient`] ties these together.

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod pending;
pub mod protocol;
pub mod request_id;
pub mod state_machine;
pub mod transport;

pub use client::DdpClient;
pub use config::ClientConfig;
pub use correlator::PendingReply;
pub use error::{DdpError, MethodError};
pub use events::{DdpEvent, EventStream, ListenerId};
pub use protocol::CollectionChange;
pub use request_id::RequestId;
pub use state_machine::session::SessionState;
