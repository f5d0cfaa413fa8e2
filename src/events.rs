//! Fan-out of collection mutations and uncorrelated messages to registered consumers.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::protocol::CollectionChange;

/// Something the server pushed that is not a reply to a pending request.
#[derive(Debug, Clone, PartialEq)]
pub enum DdpEvent {
    /// A frame with no more specific meaning, forwarded verbatim.
    Message(Value),
    Added(CollectionChange),
    Changed(CollectionChange),
    Removed { id: String, collection: String },
}

/// Handle returned on registration, used to remove the listener again.
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct ListenerId(Arc<Uuid>);

impl ListenerId {
    fn generate() -> Self {
        Self(Arc::new(Uuid::new_v4()))
    }
}

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Listener = Arc<dyn Fn(&DdpEvent) + Send + Sync>;

/// Registry of event listeners.
pub struct EventHub {
    listeners: DashMap<ListenerId, Listener, ahash::RandomState>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::default(),
        }
    }

    /// Register `listener`; it is called for every event until removed.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DdpEvent) + Send + Sync + 'static,
    {
        let id = ListenerId::generate();
        self.listeners.insert(id.clone(), Arc::new(listener));
        id
    }

    pub fn remove_listener(&self, id: &ListenerId) -> bool {
        self.listeners.remove(id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Call every listener with `event`.
    pub fn emit(&self, event: &DdpEvent) {
        // Snapshot first so a listener may add or remove listeners without deadlocking.
        let listeners: Vec<Listener> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    /// A stream of every event emitted from now on. Dropping it unregisters it.
    pub fn stream(self: &Arc<Self>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_listener(move |event| {
            let _ = tx.send(event.clone());
        });

        EventStream {
            id,
            hub: Arc::downgrade(self),
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of [`DdpEvent`]s backed by a listener on an [`EventHub`].
pub struct EventStream {
    id: ListenerId,
    hub: Weak<EventHub>,
    inner: UnboundedReceiverStream<DdpEvent>,
}

impl EventStream {
    pub fn listener_id(&self) -> &ListenerId {
        &self.id
    }
}

impl Stream for EventStream {
    type Item = DdpEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_listener(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_listener_receives_until_removed() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let id = hub.add_listener(move |event| sink.lock().unwrap().push(event.clone()));

        hub.emit(&DdpEvent::Message(json!({"msg": "a"})));
        assert!(hub.remove_listener(&id));
        hub.emit(&DdpEvent::Message(json!({"msg": "b"})));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![DdpEvent::Message(json!({"msg": "a"}))]
        );
        assert!(!hub.remove_listener(&id));
    }

    #[test]
    fn test_listener_may_remove_itself() {
        let hub = Arc::new(EventHub::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&hub);
        let own_id = Arc::clone(&slot);
        let id = hub.add_listener(move |_| {
            if let (Some(hub), Some(id)) = (weak.upgrade(), own_id.lock().unwrap().clone()) {
                hub.remove_listener(&id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        hub.emit(&DdpEvent::Message(Value::Null));
        assert_eq!(hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_receives_in_order_and_unregisters_on_drop() {
        let hub = Arc::new(EventHub::new());
        let mut stream = hub.stream();
        assert_eq!(hub.listener_count(), 1);

        hub.emit(&DdpEvent::Removed {
            id: "i1".to_string(),
            collection: "items".to_string(),
        });
        hub.emit(&DdpEvent::Message(json!({"n": 2})));

        assert!(matches!(stream.next().await, Some(DdpEvent::Removed { .. })));
        assert_eq!(
            stream.next().await,
            Some(DdpEvent::Message(json!({"n": 2})))
        );

        drop(stream);
        assert_eq!(hub.listener_count(), 0);
    }
}
