//! Per-command-scope event accumulator.
//!
//! One instance lives inside each [`CommandScope`](crate::scope::CommandScope);
//! it collects what the handler raises and is drained exactly once when the
//! pipeline builds the outbox batch. It is only ever touched from the single
//! drain step executing the command, so the internal lock is uncontended.

use std::sync::Mutex;

use crate::message::DomainEvent;

/// The three buckets a handler can fill during one command scope.
#[derive(Debug, Default, Clone)]
pub struct EventBatch {
    /// Domain events; published only when the command commits.
    pub events: Vec<DomainEvent>,
    /// Events that publish on both the success and the failure path.
    pub publish_anyway: Vec<DomainEvent>,
    /// Values routed back to the saga's reply endpoint.
    pub saga_results: Vec<serde_json::Value>,
}

impl EventBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.publish_anyway.is_empty() && self.saga_results.is_empty()
    }
}

/// In-memory collector of events and replies raised by a handler.
#[derive(Debug, Default)]
pub struct EventBus {
    inner: Mutex<EventBatch>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise_event(&self, event: DomainEvent) {
        self.inner.lock().expect("event bus poisoned").events.push(event);
    }

    pub fn raise_publish_anyway(&self, event: DomainEvent) {
        self.inner
            .lock()
            .expect("event bus poisoned")
            .publish_anyway
            .push(event);
    }

    pub fn add_saga_result(&self, result: serde_json::Value) {
        self.inner
            .lock()
            .expect("event bus poisoned")
            .saga_results
            .push(result);
    }

    /// Discards everything collected so far. Used when a retryable conflict
    /// rolls the attempt back and the handler runs again.
    pub fn clear_messages(&self) {
        *self.inner.lock().expect("event bus poisoned") = EventBatch::default();
    }

    /// Drains the buckets. Each raised message is consumed exactly once.
    pub fn snapshot(&self) -> EventBatch {
        std::mem::take(&mut *self.inner.lock().expect("event bus poisoned"))
    }
}
