use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{DdpError, MethodError};
use crate::request_id::RequestId;

/// An item-level change to a named server-side collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionChange {
    pub id: String,
    pub collection: String,
    pub fields: Map<String, Value>,
    /// Field names removed from the item (`changed` only).
    pub cleared: Vec<String>,
}

/// A decoded inbound frame sorted by what the client has to do with it.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `result` for a method call. `frame` is kept so an uncorrelated result can still be
    /// forwarded as a generic message.
    Result {
        id: RequestId,
        outcome: Result<Value, MethodError>,
        frame: Value,
    },
    /// `ready` listing subscriptions whose initial data set is complete.
    Ready { subs: Vec<RequestId>, frame: Value },
    /// `nosub` refusing (or ending) a subscription.
    NoSub {
        id: RequestId,
        error: Option<MethodError>,
        frame: Value,
    },
    Added(CollectionChange),
    Changed(CollectionChange),
    Removed { id: String, collection: String },
    /// Anything else, forwarded verbatim.
    Message(Value),
}

/// Inbound heartbeat traffic, answered before the frame reaches the delivery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Heartbeat {
    /// `id` is echoed back verbatim, whatever JSON type the server used.
    Ping { id: Option<Value> },
    Pong,
}

#[derive(Deserialize)]
struct HeartbeatTag {
    msg: Option<String>,
    id: Option<Value>,
}

/// Recognise a `ping` or `pong` frame without fully classifying it.
///
/// Returns `None` for every other frame, including ones that fail to decode; those are left
/// for the delivery queue to report.
pub fn heartbeat(text: &str) -> Option<Heartbeat> {
    if !text.contains("ping") && !text.contains("pong") {
        return None;
    }

    let tag: HeartbeatTag = serde_json::from_str(text).ok()?;
    match tag.msg.as_deref() {
        Some("ping") => Some(Heartbeat::Ping { id: tag.id }),
        Some("pong") => Some(Heartbeat::Pong),
        _ => None,
    }
}

/// Decode JSON text into a frame object.
pub fn decode(text: &str) -> Result<Value, DdpError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DdpError::MalformedFrame(e.to_string()))?;

    if !value.is_object() {
        return Err(DdpError::MalformedFrame(
            "frame is not a JSON object".to_string(),
        ));
    }

    Ok(value)
}

/// Sort a decoded frame into an [`InboundFrame`].
///
/// Fails with [`DdpError::MalformedFrame`] when the `msg` tag is recognised but the fields that
/// kind of frame requires are missing or mistyped.
pub fn classify(frame: Value) -> Result<InboundFrame, DdpError> {
    let Some(msg) = frame.get("msg").and_then(Value::as_str) else {
        return Ok(InboundFrame::Message(frame));
    };

    match msg {
        "result" => {
            let id = required_str(&frame, "result", "id")?;
            let outcome = match frame.get("error") {
                Some(error) => Err(MethodError::from_value(error)),
                None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
            };
            Ok(InboundFrame::Result {
                id: RequestId::from(id),
                outcome,
                frame,
            })
        }

        "ready" => {
            let subs = frame
                .get("subs")
                .and_then(Value::as_array)
                .ok_or_else(|| missing("ready", "subs"))?
                .iter()
                .filter_map(Value::as_str)
                .map(RequestId::from)
                .collect();
            Ok(InboundFrame::Ready { subs, frame })
        }

        "nosub" => {
            let id = required_str(&frame, "nosub", "id")?;
            let error = frame.get("error").map(MethodError::from_value);
            Ok(InboundFrame::NoSub {
                id: RequestId::from(id),
                error,
                frame,
            })
        }

        "added" => Ok(InboundFrame::Added(collection_change(&frame, msg, false)?)),

        // `updated` is what older servers and clients call `changed`.
        "changed" | "updated" => Ok(InboundFrame::Changed(collection_change(&frame, msg, true)?)),

        "removed" => Ok(InboundFrame::Removed {
            id: required_str(&frame, msg, "id")?.to_string(),
            collection: required_str(&frame, msg, "collection")?.to_string(),
        }),

        _ => Ok(InboundFrame::Message(frame)),
    }
}

fn collection_change(
    frame: &Value,
    msg: &str,
    allow_cleared: bool,
) -> Result<CollectionChange, DdpError> {
    let id = required_str(frame, msg, "id")?.to_string();
    let collection = required_str(frame, msg, "collection")?.to_string();

    let cleared: Vec<String> = if allow_cleared {
        frame
            .get("cleared")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let fields = match frame.get("fields") {
        Some(Value::Object(fields)) => fields.clone(),
        Some(_) => return Err(missing(msg, "fields")),
        None if !cleared.is_empty() => Map::new(),
        None => return Err(missing(msg, "fields")),
    };

    Ok(CollectionChange {
        id,
        collection,
        fields,
        cleared,
    })
}

fn required_str<'a>(frame: &'a Value, msg: &str, field: &str) -> Result<&'a str, DdpError> {
    frame
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(msg, field))
}

fn missing(msg: &str, field: &str) -> DdpError {
    DdpError::MalformedFrame(format!("'{msg}' frame without a valid '{field}'"))
}
