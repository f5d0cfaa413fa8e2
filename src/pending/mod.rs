use dashmap::{DashMap, Entry};
use serde_json::Value;
use tokio::sync::oneshot;

use self::error::RequestAlreadyPending;
use crate::error::DdpError;
use crate::request_id::RequestId;

pub mod error;

/// What a pending request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A `method` waiting for `result`.
    Method,
    /// A `sub` waiting for `ready` (or `nosub`).
    Subscribe,
}

/// Single-shot continuation of a correlated request.
pub type Continuation = oneshot::Sender<Result<Value, DdpError>>;

#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    continuation: Continuation,
}

/// In-flight correlated requests keyed by [`RequestId`].
///
/// Each entry is removed before its continuation runs, so a continuation fires at most once and
/// any later reply for the same id finds nothing.
#[derive(Debug)]
pub struct PendingMap {
    entries: DashMap<RequestId, PendingRequest, ahash::RandomState>,
}

impl PendingMap {
    /// Construct a new empty [`PendingMap`].
    pub fn new() -> PendingMap {
        Self::default()
    }

    /// Register a continuation for `request_id`.
    pub fn register(
        &self,
        request_id: RequestId,
        kind: RequestKind,
        continuation: Continuation,
    ) -> Result<(), RequestAlreadyPending> {
        match self.entries.entry(request_id) {
            Entry::Occupied(entry) => Err(RequestAlreadyPending {
                request_id: entry.key().clone(),
            }),

            Entry::Vacant(slot) => {
                slot.insert(PendingRequest { kind, continuation });
                Ok(())
            }
        }
    }

    /// Remove the entry for `request_id` if it is of `kind` and hand `payload` to its
    /// continuation.
    ///
    /// Returns `false` when no such entry exists, which is how late and duplicate replies are
    /// ignored.
    pub fn resolve(
        &self,
        request_id: &RequestId,
        kind: RequestKind,
        payload: Result<Value, DdpError>,
    ) -> bool {
        match self
            .entries
            .remove_if(request_id, |_, pending| pending.kind == kind)
        {
            Some((_, pending)) => {
                // The waiter may have gone away in the meantime; that's fine.
                let _ = pending.continuation.send(payload);
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `request_id` without resolving it.
    pub fn abandon(&self, request_id: &RequestId) -> bool {
        self.entries.remove(request_id).is_some()
    }

    /// Whether a request of `kind` is pending under `request_id`.
    pub fn is_pending(&self, request_id: &RequestId, kind: RequestKind) -> bool {
        self.entries
            .get(request_id)
            .is_some_and(|pending| pending.kind == kind)
    }

    /// Fail every pending request with [`DdpError::Disconnected`]. Returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| e.key().clone()).collect();

        ids.iter()
            .filter_map(|id| self.entries.remove(id))
            .map(|(_, pending)| {
                let _ = pending.continuation.send(Err(DdpError::Disconnected));
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingMap {
    fn default() -> Self {
        Self {
            entries: DashMap::default(),
        }
    }
}
