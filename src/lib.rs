//! # mailroom: an exactly-once command consumer
//!
//! mailroom pulls command messages from a durable queue, dispatches each to
//! its registered handler, atomically persists the resulting events together
//! with a handled-command marker, publishes the events and replies, and only
//! then commits the queue offset. Redelivery is therefore always safe:
//! a command's effects become durable exactly once no matter how often the
//! queue hands it back.
//!
//! ## Architecture
//!
//! ```text
//! QueueClient → Consumer → MailboxScheduler → CommandPipeline
//!                                                ├── HandlerRegistry
//!                                                ├── CommandScope / EventBus
//!                                                └── MessageStore (outbox)
//!                                    OutboxRelay ↲
//! ```
//!
//! - [`consumer`]: lifecycle, queue ingress, backpressure, shutdown order.
//! - [`mailbox`]: per-key FIFO mailboxes; serial within a key, parallel
//!   across keys, batched for fairness.
//! - [`pipeline`]: the transactional core — idempotency probe, timed handler
//!   execution, outbox build, optimistic-concurrency retry, offset commit.
//! - [`registry`]: command type → invoker function; blocking handlers are
//!   wrapped once at registration.
//! - [`scope`] / [`event_bus`]: what a handler sees while it runs.
//! - [`queue`] / [`store`]: the adapter contracts; [`memory`] ships
//!   in-memory implementations for tests and local runs.
//! - [`relay`]: background re-publish of outbox rows the direct publish
//!   missed.
//!
//! ## Guarantees
//!
//! - A handled-command record exists iff that command's envelopes are in the
//!   outbox (one transaction).
//! - An offset is committed only after its command is durable, a duplicate,
//!   or unroutable.
//! - Commands sharing a routing key are handled in delivery order.
//! - In-flight work never exceeds the configured full-load threshold.

pub mod config;
pub mod consumer;
pub mod event_bus;
pub mod mailbox;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod scope;
pub mod store;

pub use config::{ConsumerConfig, RelayConfig, RetryConfig};
pub use consumer::{Consumer, ConsumerError, ConsumerResult};
pub use event_bus::{EventBatch, EventBus};
pub use message::{
    CommandMessage, CommandPayload, DomainEvent, EventEnvelope, MessageContext, Offset,
    OutboundEnvelope, ReplyEnvelope, ReplyPayload, SagaInfo,
};
pub use metrics::{ConsumerMetrics, MetricsSnapshot};
pub use queue::{QueueClient, QueueError};
pub use registry::{CommandHandler, HandlerError, HandlerRegistry, HandlerResult};
pub use scope::CommandScope;
pub use store::{
    FailedCommandRecord, FailureInfo, FailureKind, HandledCommandRecord, MessageStore,
    OutboxRecord, StoreError,
};
