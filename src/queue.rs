//! Queue client adapter contract.
//!
//! The transport (Kafka, Service Bus, ...) lives behind this trait. The core
//! consumes a bounded subscription stream — the bound is the backpressure
//! contract: when the consumer stops pulling, the adapter's deliveries block
//! and it pauses its own polling. Adapters must deliver messages bearing the
//! same `routing_key` in producer order within one consumer generation.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::message::{
    DomainEvent, EventEnvelope, MessageContext, OutboundEnvelope, ReplyEnvelope, ReplyPayload,
};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("offset commit failed: {0}")]
    Commit(String),

    #[error("queue client is stopped")]
    Stopped,
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Stream of inbound contexts. Dropping it cancels the subscription.
pub type CommandStream = mpsc::Receiver<MessageContext>;

/// Adapter contract for the message-queue transport.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// The producer name stamped onto outbound envelopes.
    fn producer(&self) -> &str;

    /// Begins delivery for `queue` under `consumer_group`. `wait_interval`
    /// is the adapter's poll cadence hint.
    async fn subscribe(
        &self,
        queue: &str,
        consumer_group: &str,
        wait_interval: Duration,
    ) -> QueueResult<CommandStream>;

    /// Marks this offset and all lower offsets on the same partition as
    /// durably consumed.
    async fn commit_offset(&self, ctx: &MessageContext) -> QueueResult<()>;

    /// Best-effort transport send of already-durable envelopes.
    async fn publish(&self, envelopes: &[OutboundEnvelope]) -> QueueResult<()>;

    /// Quiescent shutdown: no new deliveries; in-flight deliveries drain.
    async fn stop(&self) -> QueueResult<()>;

    /// Wraps a raised domain event into an outbound envelope, stamping the
    /// event id, producer, and the source command's saga info.
    fn wrap_event(&self, source: &MessageContext, event: DomainEvent) -> OutboundEnvelope {
        OutboundEnvelope::Event(EventEnvelope {
            event_id: Uuid::new_v4().to_string(),
            source_command_id: source.message.message_id.clone(),
            topic: event.topic,
            key: event.key,
            saga_info: source.message.saga_info.clone(),
            producer: self.producer().to_string(),
            payload: event.payload,
        })
    }

    /// Wraps a reply for `endpoint`, correlated by the source command id.
    fn wrap_reply(
        &self,
        source: &MessageContext,
        endpoint: &str,
        payload: ReplyPayload,
    ) -> OutboundEnvelope {
        OutboundEnvelope::Reply(ReplyEnvelope {
            reply_id: Uuid::new_v4().to_string(),
            correlation_id: source.message.message_id.clone(),
            endpoint: endpoint.to_string(),
            producer: self.producer().to_string(),
            saga_info: source.message.saga_info.clone(),
            payload,
        })
    }
}
