use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::DdpError;
use crate::pending::{PendingMap, RequestKind};
use crate::protocol::{OutboundFrame, encode};
use crate::request_id::{RequestId, RequestIdGenerator};

/// Anything that can put an encoded frame on the wire.
pub trait FrameSink {
    /// Send `text` verbatim, failing with [`DdpError::NotConnected`] if the session isn't open.
    fn send_frame(&self, text: String) -> Result<(), DdpError>;
}

/// Turns outbound `method`/`sub` frames into awaitable replies.
///
/// The correlator owns the request id counter and the table of pending requests. Callers
/// register through [`call_method`](Self::call_method) and [`subscribe`](Self::subscribe); the
/// dispatcher completes them through [`resolve`](Self::resolve).
#[derive(Debug, Default)]
pub struct Correlator {
    ids: RequestIdGenerator,
    pending: PendingMap,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently issued request id.
    pub fn last_request_id(&self) -> Option<u64> {
        self.ids.last_issued()
    }

    /// Send a `method` frame and return a handle resolving with its `result`.
    ///
    /// The pending entry is registered before the frame is sent, so a reply can never overtake
    /// its registration.
    pub fn call_method<S: FrameSink + ?Sized>(
        self: &Arc<Self>,
        sink: &S,
        method: &str,
        params: &[Value],
    ) -> Result<PendingReply, DdpError> {
        let id = self.ids.next_id();
        let text = encode(&OutboundFrame::Method {
            method,
            params,
            id: &id,
        })?;

        self.send_correlated(sink, id, RequestKind::Method, text)
    }

    /// Send a `method` frame without waiting for its result.
    pub fn notify_method<S: FrameSink + ?Sized>(
        &self,
        sink: &S,
        method: &str,
        params: &[Value],
    ) -> Result<RequestId, DdpError> {
        let id = self.ids.next_id();
        let text = encode(&OutboundFrame::Method {
            method,
            params,
            id: &id,
        })?;

        sink.send_frame(text)?;
        Ok(id)
    }

    /// Send a `sub` frame and return a handle resolving with the `ready` frame that lists it.
    pub fn subscribe<S: FrameSink + ?Sized>(
        self: &Arc<Self>,
        sink: &S,
        name: &str,
        params: &[Value],
    ) -> Result<PendingReply, DdpError> {
        let id = self.ids.next_id();
        let text = encode(&OutboundFrame::Sub {
            name,
            params,
            id: &id,
        })?;

        self.send_correlated(sink, id, RequestKind::Subscribe, text)
    }

    fn send_correlated<S: FrameSink + ?Sized>(
        self: &Arc<Self>,
        sink: &S,
        id: RequestId,
        kind: RequestKind,
        text: String,
    ) -> Result<PendingReply, DdpError> {
        let (tx, rx) = oneshot::channel();
        self.pending.register(id.clone(), kind, tx)?;

        if let Err(e) = sink.send_frame(text) {
            self.pending.abandon(&id);
            return Err(e);
        }

        debug!(request_id = %id, kind = ?kind, "Registered pending request");

        Ok(PendingReply {
            id,
            rx,
            correlator: Arc::downgrade(self),
            done: false,
        })
    }

    /// Complete the pending request `id` of `kind` with `payload`.
    ///
    /// Returns `false`, doing nothing, if no such request is pending.
    pub fn resolve(
        &self,
        id: &RequestId,
        kind: RequestKind,
        payload: Result<Value, DdpError>,
    ) -> bool {
        self.pending.resolve(id, kind, payload)
    }

    pub fn is_pending(&self, id: &RequestId, kind: RequestKind) -> bool {
        self.pending.is_pending(id, kind)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fail every pending request with [`DdpError::Disconnected`].
    pub fn cancel_all(&self) -> usize {
        self.pending.cancel_all()
    }

    fn abandon(&self, id: &RequestId) {
        if self.pending.abandon(id) {
            debug!(request_id = %id, "Pending request abandoned by caller");
        }
    }
}

/// Awaitable reply to a correlated request.
///
/// Dropping it before it completes unregisters the request, so a late reply is ignored.
#[derive(Debug)]
pub struct PendingReply {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value, DdpError>>,
    correlator: Weak<Correlator>,
    done: bool,
}

impl PendingReply {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait at most `timeout` for the reply. On timeout the request is abandoned.
    pub async fn with_timeout(self, timeout: Duration) -> Result<Value, DdpError> {
        tokio::time::timeout(timeout, self).await?
    }
}

impl Future for PendingReply {
    type Output = Result<Value, DdpError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                // A dropped sender means the table went away with the client.
                Poll::Ready(result.unwrap_or(Err(DdpError::Disconnected)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.abandon(&self.id);
        }
    }
}
