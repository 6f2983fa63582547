//! Kind-routed event handlers.

use crate::bus::RelayEvent;
use crate::error::Result;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Callback type for handling received events.
pub type EventHandler = Arc<dyn Fn(&RelayEvent) -> Result<()> + Send + Sync>;

/// Ordered handler lists keyed by event kind.
///
/// Lists are replaced wholesale on every change, so a dispatch that already
/// took its snapshot keeps running against the list it saw.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<u16, Arc<[EventHandler]>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: u16, handler: EventHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated: Vec<EventHandler> = handlers
            .get(&kind)
            .map(|existing| existing.to_vec())
            .unwrap_or_default();
        updated.push(handler);
        handlers.insert(kind, updated.into());
    }

    /// Remove every handler for `kind`. Returns how many were removed.
    pub fn remove_kind(&self, kind: u16) -> usize {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
            .map_or(0, |removed| removed.len())
    }

    /// Remove one registration of `handler` (same `Arc`) for `kind`.
    pub fn remove_instance(&self, kind: u16, handler: &EventHandler) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(existing) = handlers.get(&kind) else {
            return false;
        };
        let Some(position) = existing
            .iter()
            .position(|registered| Arc::ptr_eq(registered, handler))
        else {
            return false;
        };

        let mut updated = existing.to_vec();
        updated.remove(position);
        if updated.is_empty() {
            handlers.remove(&kind);
        } else {
            handlers.insert(kind, updated.into());
        }
        true
    }

    pub fn kinds(&self) -> Vec<u16> {
        let mut kinds: Vec<u16> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        kinds.sort_unstable();
        kinds
    }

    fn snapshot(&self, kind: u16) -> Option<Arc<[EventHandler]>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    /// Run every handler registered for the event's kind, in registration order.
    ///
    /// A handler that returns an error or panics is logged and skipped.
    /// Returns the number of handlers that completed successfully.
    pub fn dispatch(&self, relay_event: &RelayEvent) -> usize {
        let kind = relay_event.event.kind;
        let Some(handlers) = self.snapshot(kind) else {
            debug!(
                "no handlers registered for kind {} (event {} from {})",
                kind, relay_event.event.id, relay_event.relay_url
            );
            return 0;
        };

        let mut completed = 0;
        for handler in handlers.iter() {
            match catch_unwind(AssertUnwindSafe(|| handler(relay_event))) {
                Ok(Ok(())) => completed += 1,
                Ok(Err(error)) => warn!(
                    "handler for kind {} failed on event from {}: {}",
                    kind, relay_event.relay_url, error
                ),
                Err(payload) => warn!(
                    "handler for kind {} panicked on event from {}: {}",
                    kind,
                    relay_event.relay_url,
                    panic_message(payload.as_ref())
                ),
            }
        }
        completed
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
