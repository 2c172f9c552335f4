//! Wire-level message types: inbound command messages, the consumer-side
//! message context with its commit token, and the outbound envelopes the
//! pipeline persists to the outbox and hands to the publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Correlation data for a saga-coordinated command. The saga id is opaque to
/// the consumer; replies route back to `reply_endpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInfo {
    pub saga_id: String,
    #[serde(default)]
    pub reply_endpoint: Option<String>,
}

impl SagaInfo {
    /// A saga reply is only produced when both halves are present.
    pub fn reply_target(&self) -> Option<&str> {
        if self.saga_id.is_empty() {
            return None;
        }
        self.reply_endpoint.as_deref()
    }
}

/// The typed body of a command message. `type_name` selects the handler;
/// `body` is deserialized by the registered invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(rename = "type")]
    pub type_name: String,
    pub body: serde_json::Value,
}

impl CommandPayload {
    pub fn new(type_name: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            type_name: type_name.into(),
            body,
        }
    }

    /// Non-command messages on the command queue carry no type name; they are
    /// treated as poison but not fatal.
    pub fn is_command(&self) -> bool {
        !self.type_name.is_empty()
    }
}

/// An inbound command as produced by the upstream writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Globally unique, producer-generated. The idempotency key.
    pub message_id: String,
    /// Orders related commands (e.g. an aggregate id). May be empty.
    #[serde(default)]
    pub routing_key: String,
    pub payload: CommandPayload,
    #[serde(default)]
    pub reply_endpoint: Option<String>,
    #[serde(default)]
    pub saga_info: Option<SagaInfo>,
    /// Retry on optimistic-concurrency conflict.
    #[serde(default)]
    pub need_retry: bool,
    pub producer: String,
}

impl CommandMessage {
    pub fn wants_reply(&self) -> bool {
        self.reply_endpoint.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Queue-assigned commit token. Offsets are comparable only within one
/// partition; committing an offset acknowledges it and all lower offsets on
/// the same partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub partition: String,
    pub value: u64,
}

/// A command message wrapped with consumer-side metadata and its commit
/// token. Owned by the orchestrator until handed to a mailbox, by the mailbox
/// until the pipeline returns, then by the orchestrator again for the offset
/// commit.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message: CommandMessage,
    pub offset: Offset,
    pub consumer_group: String,
    pub received_at: DateTime<Utc>,
}

impl MessageContext {
    /// Mailbox key: the routing key, falling back to the message id so that
    /// unkeyed commands degenerate to per-message mailboxes.
    pub fn mailbox_key(&self) -> &str {
        if self.message.routing_key.is_empty() {
            &self.message.message_id
        } else {
            &self.message.routing_key
        }
    }
}

/// A domain event raised by a handler. The topic and key travel with the
/// event; the queue client stamps the rest when wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
}

impl DomainEvent {
    pub fn new(
        topic: impl Into<String>,
        key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
        }
    }
}

/// Outbound event envelope, persisted to the outbox and published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub source_command_id: String,
    pub topic: String,
    pub key: String,
    #[serde(default)]
    pub saga_info: Option<SagaInfo>,
    pub producer: String,
    pub payload: serde_json::Value,
}

/// The payload of a reply envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum ReplyPayload {
    /// Whatever the handler set on the scope (null when it set nothing).
    HandlerReply(serde_json::Value),
    /// Idempotency hit: the command was already handled.
    MessageDuplicatelyHandled,
    /// No handler is registered for the command type.
    NoHandlerExists,
    /// The handler (or the save) failed.
    FailureReply {
        exception_type: String,
        message: String,
    },
}

/// Outbound reply envelope; `correlation_id` is always the source command id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub reply_id: String,
    pub correlation_id: String,
    pub endpoint: String,
    pub producer: String,
    #[serde(default)]
    pub saga_info: Option<SagaInfo>,
    pub payload: ReplyPayload,
}

/// Everything the pipeline hands to the outbox and the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundEnvelope {
    Event(EventEnvelope),
    Reply(ReplyEnvelope),
}

impl OutboundEnvelope {
    /// The envelope's unique id, used as the outbox primary key.
    pub fn envelope_id(&self) -> &str {
        match self {
            Self::Event(e) => &e.event_id,
            Self::Reply(r) => &r.reply_id,
        }
    }

    pub fn source_command_id(&self) -> &str {
        match self {
            Self::Event(e) => &e.source_command_id,
            Self::Reply(r) => &r.correlation_id,
        }
    }

    /// Destination: the event topic or the reply endpoint.
    pub fn destination(&self) -> &str {
        match self {
            Self::Event(e) => &e.topic,
            Self::Reply(r) => &r.endpoint,
        }
    }
}
