use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::pending::error::RequestAlreadyPending;
use crate::request_id::RequestId;

/// Errors that can occur in the DDP client.
#[derive(Debug, Error)]
pub enum DdpError {
    /// A frame was sent while the session was not open.
    #[error("session is not connected")]
    NotConnected,

    /// `connect` was called while a connection attempt is already in flight.
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    /// An inbound frame could not be decoded or did not have the expected shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The session closed while the request was still pending.
    #[error("session disconnected before a reply arrived")]
    Disconnected,

    /// The transport reported an error.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The server address could not be turned into a websocket URL.
    #[error("invalid server address")]
    InvalidAddress(#[from] url::ParseError),

    /// Failed to encode an outbound frame.
    #[error("frame encode error")]
    Encode(#[from] serde_json::Error),

    /// Timeout waiting for the transport to open or for a reply.
    #[error("timeout waiting for the server")]
    Timeout(#[from] tokio::time::error::Elapsed),

    /// A request id was registered twice while still pending.
    #[error(transparent)]
    DuplicateRequest(#[from] RequestAlreadyPending),

    /// The server answered a method call with an error.
    #[error("method failed: {0}")]
    Method(MethodError),

    /// The server refused a subscription with `nosub`.
    #[error("subscription {id} rejected")]
    SubscriptionRejected {
        id: RequestId,
        error: Option<MethodError>,
    },
}

/// The `error` object carried by a `result` or `nosub` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MethodError {
    /// Error code; servers send either a number or a string.
    pub error: Value,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

impl MethodError {
    /// Read a [`MethodError`] out of an arbitrary JSON value, keeping the raw value as the code
    /// when it isn't an object.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
            error: value.clone(),
            reason: None,
            message: None,
            details: None,
        })
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.reason, &self.message) {
            (Some(reason), _) => write!(f, "{} ({})", reason, self.error),
            (None, Some(message)) => f.write_str(message),
            (None, None) => write!(f, "{}", self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_error_from_object() {
        let err = MethodError::from_value(&json!({
            "error": 403,
            "reason": "Incorrect password",
            "message": "Incorrect password [403]",
        }));

        assert_eq!(err.error, json!(403));
        assert_eq!(err.reason.as_deref(), Some("Incorrect password"));
        assert_eq!(err.to_string(), "Incorrect password (403)");
    }

    #[test]
    fn test_method_error_from_scalar() {
        let err = MethodError::from_value(&json!("not-found"));
        assert_eq!(err.error, json!("not-found"));
        assert!(err.reason.is_none());
    }
}
