//! Single consumer-facing stream of everything the pool accepts from relays.

use nostr::Event;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// An event together with the relay and subscription it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEvent {
    pub relay_url: String,
    pub subscription_id: String,
    pub event: Event,
}

/// Item yielded by [`EventStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum PoolNotification {
    Event(RelayEvent),
    EndOfStoredEvents {
        relay_url: String,
        subscription_id: String,
    },
}

impl PoolNotification {
    pub fn relay_url(&self) -> &str {
        match self {
            Self::Event(relay_event) => &relay_event.relay_url,
            Self::EndOfStoredEvents { relay_url, .. } => relay_url,
        }
    }
}

/// Unbounded multi-producer queue feeding [`EventStream`] consumers.
pub struct EventBus {
    sender: Mutex<Option<mpsc::UnboundedSender<PoolNotification>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PoolNotification>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    /// Queue a notification. Returns `false` once the bus is closed.
    pub fn push(&self, notification: PoolNotification) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|sender| sender.send(notification).is_ok())
    }

    /// Stop accepting notifications. Queued items stay readable.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn stream(&self) -> EventStream {
        EventStream {
            receiver: Arc::clone(&self.receiver),
        }
    }
}

/// Consumer handle on the event bus.
///
/// Clones share one queue: each notification is delivered to exactly one
/// `recv` caller.
#[derive(Clone)]
pub struct EventStream {
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PoolNotification>>>,
}

impl EventStream {
    /// Next notification, or `None` once the bus is closed and drained.
    pub async fn recv(&self) -> Option<PoolNotification> {
        self.receiver.lock().await.recv().await
    }

    /// Next notification if one is queued right now.
    ///
    /// Also returns `None` while another clone is parked in
    /// [`EventStream::recv`], even if items are queued.
    pub fn try_recv(&self) -> Option<PoolNotification> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }
}
