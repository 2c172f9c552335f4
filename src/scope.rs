//! Per-command scope.
//!
//! Built fresh for every message, the scope is what a handler sees: the
//! command, the event bus, the store handle (so handler repositories and the
//! pipeline share one unit of work), a reply slot, a context bag for
//! user extensions, and the shutdown signal. There is no ambient or global
//! lookup; everything arrives through the scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::event_bus::EventBus;
use crate::message::{CommandMessage, DomainEvent};
use crate::store::MessageStore;

pub struct CommandScope {
    command: CommandMessage,
    event_bus: EventBus,
    store: Arc<dyn MessageStore>,
    reply: Mutex<Option<serde_json::Value>>,
    values: Mutex<HashMap<String, serde_json::Value>>,
    shutdown: broadcast::Sender<()>,
}

impl CommandScope {
    pub fn new(
        command: CommandMessage,
        store: Arc<dyn MessageStore>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            command,
            event_bus: EventBus::new(),
            store,
            reply: Mutex::new(None),
            values: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn command(&self) -> &CommandMessage {
        &self.command
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// The store this command's writes flow through.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn raise_event(&self, event: DomainEvent) {
        self.event_bus.raise_event(event);
    }

    pub fn raise_publish_anyway(&self, event: DomainEvent) {
        self.event_bus.raise_publish_anyway(event);
    }

    pub fn add_saga_result(&self, result: serde_json::Value) {
        self.event_bus.add_saga_result(result);
    }

    /// Sets the value carried back on the reply envelope when the producer
    /// asked for a reply.
    pub fn set_reply(&self, value: serde_json::Value) {
        *self.reply.lock().expect("reply slot poisoned") = Some(value);
    }

    pub(crate) fn take_reply(&self) -> Option<serde_json::Value> {
        self.reply.lock().expect("reply slot poisoned").take()
    }

    /// Context bag for handler extensions.
    pub fn set_value(&self, key: impl Into<String>, value: serde_json::Value) {
        self.values
            .lock()
            .expect("context bag poisoned")
            .insert(key.into(), value);
    }

    pub fn get_value(&self, key: &str) -> Option<serde_json::Value> {
        self.values
            .lock()
            .expect("context bag poisoned")
            .get(key)
            .cloned()
    }

    /// Fires when the consumer is stopping. Handlers are expected to observe
    /// it and abort cleanly; the command will be redelivered.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}
