use std::sync::{Arc, Mutex};

use serde_json::Value;
use url::Url;

use super::{Transport, TransportHandler, TransportState};
use crate::error::DdpError;

/// In-process transport that plays the server side by hand.
///
/// Clones share the same link, so a test keeps one clone to inject inbound frames and inspect
/// what the client sent. Every callback is delivered synchronously on the caller's thread.
#[derive(Clone)]
pub struct MemoryTransport {
    link: Arc<Mutex<MemoryLink>>,
}

struct MemoryLink {
    state: TransportState,
    handler: Option<Arc<dyn TransportHandler>>,
    auto_open: bool,
    opened_urls: Vec<Url>,
    sent: Vec<String>,
}

impl MemoryTransport {
    /// A transport that reports open as soon as it is asked to open.
    pub fn new() -> Self {
        Self::with_auto_open(true)
    }

    /// A transport that stays Connecting until [`complete_open`](Self::complete_open) is called.
    pub fn manual() -> Self {
        Self::with_auto_open(false)
    }

    fn with_auto_open(auto_open: bool) -> Self {
        Self {
            link: Arc::new(Mutex::new(MemoryLink {
                state: TransportState::Closed,
                handler: None,
                auto_open,
                opened_urls: Vec::new(),
                sent: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLink> {
        self.link.lock().expect("memory link lock poisoned")
    }

    /// Report the pending open as complete.
    pub fn complete_open(&self) {
        let handler = {
            let mut link = self.lock();
            if link.state != TransportState::Connecting {
                return;
            }
            link.state = TransportState::Open;
            link.handler.clone()
        };

        if let Some(handler) = handler {
            handler.on_open();
        }
    }

    /// Deliver one inbound text frame, as if the server had sent it.
    pub fn deliver(&self, text: impl Into<String>) {
        let handler = {
            let link = self.lock();
            if link.state != TransportState::Open {
                return;
            }
            link.handler.clone()
        };

        if let Some(handler) = handler {
            handler.on_message(text.into());
        }
    }

    /// Deliver a JSON value as an inbound frame.
    pub fn deliver_json(&self, frame: &Value) {
        self.deliver(frame.to_string());
    }

    /// Fail the connection with `reason`.
    pub fn fail(&self, reason: impl Into<String>) {
        if let Some(handler) = self.shut() {
            handler.on_error(reason.into());
        }
    }

    /// Close the connection from the server side.
    pub fn server_close(&self) {
        if let Some(handler) = self.shut() {
            handler.on_closed();
        }
    }

    fn shut(&self) -> Option<Arc<dyn TransportHandler>> {
        let mut link = self.lock();
        if link.state == TransportState::Closed {
            return None;
        }
        link.state = TransportState::Closed;
        link.handler.take()
    }

    /// Every frame sent so far, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Every frame sent so far, decoded.
    pub fn sent_json(&self) -> Vec<Value> {
        self.lock()
            .sent
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// URLs passed to `open`, oldest first.
    pub fn opened_urls(&self) -> Vec<Url> {
        self.lock().opened_urls.clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn open(&self, url: &Url, handler: Arc<dyn TransportHandler>) -> Result<(), DdpError> {
        let auto_open = {
            let mut link = self.lock();
            if matches!(link.state, TransportState::Connecting | TransportState::Open) {
                return Err(DdpError::AlreadyConnecting);
            }
            link.state = TransportState::Connecting;
            link.handler = Some(handler);
            link.opened_urls.push(url.clone());
            link.auto_open
        };

        if auto_open {
            self.complete_open();
        }
        Ok(())
    }

    fn send(&self, text: String) -> Result<(), DdpError> {
        let mut link = self.lock();
        if link.state != TransportState::Open {
            return Err(DdpError::NotConnected);
        }
        link.sent.push(text);
        Ok(())
    }

    fn close(&self) {
        self.server_close();
    }

    fn state(&self) -> TransportState {
        self.lock().state
    }
}
