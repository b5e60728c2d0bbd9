//! Event pub-sub registry
//!
//! An explicit subscriber list replaces emitter-style fan-out: subscribers
//! are delivered to in registration order, each through its own unbounded
//! channel, so a slow or dropped subscriber never blocks delivery to the
//! rest. Background tasks publish their failures here as `error` events
//! instead of swallowing them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::time::current_time_millis;

/// An event flowing through the bus
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    /// Event type, e.g. `message.updated`, `health.down`, `error`
    pub kind: String,
    /// Opaque event data
    pub data: Value,
    /// Publish time, milliseconds since epoch
    pub timestamp: u64,
}

impl BusEvent {
    /// Create an event stamped with the current time
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: current_time_millis(),
        }
    }

    /// Create an `error` event from a background task failure
    pub fn error(context: &str, message: &str) -> Self {
        Self::new(
            "error",
            serde_json::json!({ "context": context, "message": message }),
        )
    }
}

/// Handle identifying one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

/// Ordered publish-subscribe registry
pub struct EventBus {
    subscribers: Mutex<Vec<(SubscriberId, mpsc::UnboundedSender<BusEvent>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a subscriber. Delivery order follows registration order.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<BusEvent>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push((id, tx));
        (id, rx)
    }

    /// Remove a subscriber
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .retain(|(sid, _)| *sid != id);
    }

    /// Deliver an event to every live subscriber, pruning dropped ones.
    /// A failed send to one subscriber never affects the others.
    pub fn publish(&self, event: BusEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|(id, tx)| {
            if tx.send(event.clone()).is_err() {
                tracing::debug!("Pruning dropped event subscriber {:?}", id);
                false
            } else {
                true
            }
        });
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
