use serde::Serialize;
use serde_json::Value;

use crate::error::DdpError;
use crate::request_id::RequestId;

/// A frame the client sends to the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum OutboundFrame<'a> {
    /// Handshake, sent once every time the transport opens.
    Connect {
        version: &'a str,
        support: &'a [String],
    },

    /// Remote method invocation.
    Method {
        method: &'a str,
        params: &'a [Value],
        id: &'a RequestId,
    },

    /// Subscription request.
    Sub {
        name: &'a str,
        params: &'a [Value],
        id: &'a RequestId,
    },

    /// Heartbeat acknowledgement. Echoes the ping `id` when the server sent one.
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a Value>,
    },
}

/// Encode an outbound frame to JSON text.
pub fn encode(frame: &OutboundFrame<'_>) -> Result<String, DdpError> {
    Ok(serde_json::to_string(frame)?)
}
