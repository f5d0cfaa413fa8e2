//! # protocol
//!
//! Wire vocabulary of the DDP protocol as seen from a client.
//!
//! Outbound frames are built from [`OutboundFrame`] and encoded to JSON text. Inbound text is
//! decoded to a JSON object and sorted into an [`InboundFrame`] by [`classify`].
//!
//! ## Address Format
//!
//! The server is always reached at `/websocket` under the given host:
//! - Plain: `ws://{host}/websocket`
//! - Secure: `wss://{host}/websocket`

mod frame;
mod inbound;

pub use frame::{OutboundFrame, encode};
pub use inbound::{CollectionChange, Heartbeat, InboundFrame, classify, decode, heartbeat};

use url::Url;

use crate::error::DdpError;

/// Build the websocket URL for a DDP server host (e.g. `localhost:3000`).
pub fn websocket_url(host: &str, secure: bool) -> Result<Url, DdpError> {
    let scheme = if secure { "wss" } else { "ws" };
    Ok(Url::parse(&format!("{scheme}://{host}/websocket"))?)
}
