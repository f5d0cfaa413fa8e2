use std::sync::Arc;

use tracing::{trace, warn};

use crate::correlator::Correlator;
use crate::error::DdpError;
use crate::events::{DdpEvent, EventHub};
use crate::pending::RequestKind;
use crate::protocol::{InboundFrame, classify, decode};

/// Where a frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Completed a pending method call.
    Result,
    /// A `ready` frame; `resolved` pending subscriptions were completed.
    Ready { resolved: usize },
    /// Failed a pending subscription.
    NoSub,
    /// Emitted as a collection mutation.
    Mutation,
    /// Emitted as a generic message.
    Message,
    /// Dropped as malformed.
    Dropped,
}

/// Classifies inbound frames and routes them to the correlator or the event listeners.
///
/// Priority, first match wins:
/// 1. `result` for a pending method call completes that call.
/// 2. `ready` completes every listed subscription that is pending; unknown ids are ignored.
/// 3. `added`/`changed`/`removed` are emitted as collection mutations.
/// 4. Everything else, including uncorrelated `result`s, is emitted as a generic message.
pub struct Dispatcher {
    correlator: Arc<Correlator>,
    events: Arc<EventHub>,
}

impl Dispatcher {
    pub fn new(correlator: Arc<Correlator>, events: Arc<EventHub>) -> Self {
        Self { correlator, events }
    }

    /// Decode and dispatch one raw frame. Malformed frames are logged and dropped.
    pub fn dispatch_raw(&self, raw: &str) -> Route {
        match decode(raw).and_then(classify) {
            Ok(frame) => self.dispatch(frame),
            Err(e) => {
                warn!(error = %e, frame = %truncate(raw), "Dropping inbound frame");
                Route::Dropped
            }
        }
    }

    pub fn dispatch(&self, frame: InboundFrame) -> Route {
        let route = match frame {
            InboundFrame::Result { id, outcome, frame } => {
                let payload = outcome.map_err(DdpError::Method);
                if self.correlator.resolve(&id, RequestKind::Method, payload) {
                    Route::Result
                } else {
                    self.events.emit(&DdpEvent::Message(frame));
                    Route::Message
                }
            }

            InboundFrame::Ready { subs, frame } => {
                let resolved = subs
                    .iter()
                    .filter(|id| {
                        self.correlator
                            .resolve(id, RequestKind::Subscribe, Ok(frame.clone()))
                    })
                    .count();
                Route::Ready { resolved }
            }

            InboundFrame::NoSub { id, error, frame } => {
                let rejected = DdpError::SubscriptionRejected {
                    id: id.clone(),
                    error,
                };
                if self
                    .correlator
                    .resolve(&id, RequestKind::Subscribe, Err(rejected))
                {
                    Route::NoSub
                } else {
                    // The server ended a subscription that was already ready.
                    self.events.emit(&DdpEvent::Message(frame));
                    Route::Message
                }
            }

            InboundFrame::Added(change) => {
                self.events.emit(&DdpEvent::Added(change));
                Route::Mutation
            }

            InboundFrame::Changed(change) => {
                self.events.emit(&DdpEvent::Changed(change));
                Route::Mutation
            }

            InboundFrame::Removed { id, collection } => {
                self.events.emit(&DdpEvent::Removed { id, collection });
                Route::Mutation
            }

            InboundFrame::Message(frame) => {
                self.events.emit(&DdpEvent::Message(frame));
                Route::Message
            }
        };

        trace!(route = ?route, "Dispatched inbound frame");
        route
    }
}

fn truncate(raw: &str) -> &str {
    const MAX: usize = 256;
    if raw.len() <= MAX {
        return raw;
    }
    let mut end = MAX;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    &raw[..end]
}
