//! In-process publish-subscribe dispatcher.
//!
//! Events are keyed by string name; `"*"` subscribes to every event emitted
//! under any other name. Delivery is synchronous on the emitter's execution
//! context, best-effort, per-name FIFO. A panicking handler never prevents
//! delivery to the handlers after it.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

/// Handler invoked with the event name and its payload.
pub type EventHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// The wildcard subscription name.
pub const WILDCARD: &str = "*";

struct HandlerEntry {
    token: u64,
    once: bool,
    handler: EventHandler,
}

#[derive(Default)]
struct BusInner {
    handlers: HashMap<String, Vec<HandlerEntry>>,
    next_token: u64,
}

/// Cheaply-cloneable bus handle.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

/// Handle to one registration; unsubscribes on drop or via
/// [`Subscription::unsubscribe`].
pub struct Subscription {
    bus: Weak<Mutex<BusInner>>,
    event: String,
    token: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop impl does the work.
    }

    fn remove(&self) {
        if let Some(inner) = self.bus.upgrade() {
            let mut inner = inner.lock().expect("event bus lock poisoned");
            if let Some(entries) = inner.handlers.get_mut(&self.event) {
                entries.retain(|e| e.token != self.token);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, event: &str, once: bool, handler: EventHandler) -> Subscription {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let token = inner.next_token;
        inner.next_token += 1;
        inner
            .handlers
            .entry(event.to_string())
            .or_default()
            .push(HandlerEntry {
                token,
                once,
                handler,
            });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            event: event.to_string(),
            token,
        }
    }

    /// Register a handler for a specific event name, or `"*"` for all.
    pub fn on(&self, event: &str, handler: EventHandler) -> Subscription {
        self.register(event, false, handler)
    }

    /// Register a handler removed automatically after its first delivery.
    pub fn once(&self, event: &str, handler: EventHandler) -> Subscription {
        self.register(event, true, handler)
    }

    /// Remove a handler by its subscription.
    pub fn off(&self, subscription: Subscription) {
        subscription.unsubscribe();
    }

    /// Synchronous fan-out: specific handlers first, then wildcard handlers.
    /// Emitting `"*"` itself does not re-trigger wildcard handlers.
    pub fn emit(&self, event: &str, data: Value) {
        let batch: Vec<EventHandler> = {
            let mut inner = self.inner.lock().expect("event bus lock poisoned");
            let mut batch = Vec::new();
            for key in [event, WILDCARD] {
                if key == WILDCARD && event == WILDCARD {
                    continue;
                }
                if let Some(entries) = inner.handlers.get_mut(key) {
                    for entry in entries.iter() {
                        batch.push(entry.handler.clone());
                    }
                    entries.retain(|e| !e.once);
                }
            }
            batch
        };

        for handler in batch {
            if catch_unwind(AssertUnwindSafe(|| handler(event, &data))).is_err() {
                tracing::warn!(event, "event handler panicked; continuing fan-out");
            }
        }
    }

    /// Number of live registrations for an event name.
    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .handlers
            .get(event)
            .map_or(0, Vec::len)
    }
}
