//! Message store adapter contract.
//!
//! The store persists the handled-command marker, the outbox rows, and
//! failure records. `save_command` is atomic by contract: the marker and the
//! outbox rows of one command either all commit or none do, which is what
//! makes redelivery safe. Adapters own their transaction demarcation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{MessageContext, OutboundEnvelope};

/// Idempotency marker: present iff the command's effects are durable.
/// Unique on `(message_id, consumer_group)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandledCommandRecord {
    pub message_id: String,
    pub consumer_group: String,
    pub handled_at: DateTime<Utc>,
    pub result_summary: String,
}

/// A durable envelope awaiting transport publication. `seq` is a
/// store-assigned monotonic sequence preserving insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub envelope_id: String,
    pub seq: u64,
    pub source_command_id: String,
    pub envelope: OutboundEnvelope,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCommandRecord {
    pub message_id: String,
    pub consumer_group: String,
    pub error_type: String,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
}

/// Classification of a recorded failure, carried on failure replies and
/// failed-command rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FailureKind {
    /// Business-rule violation raised by the handler, including version
    /// conflicts the command did not opt to retry. Logged at `warn`.
    Domain,
    /// Everything else, including handler timeouts and conflicts that
    /// survived the retry budget. Logged at `error`.
    System,
}

/// What the pipeline records about a failed command.
#[derive(Debug, Clone)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Version conflict on a shared aggregate; retryable iff the command
    /// carries `need_retry`.
    #[error("optimistic concurrency conflict: {0}")]
    Concurrency(String),

    /// Unique-constraint hit on `(message_id, consumer_group)`.
    #[error("command already handled: {message_id}")]
    DuplicateCommand { message_id: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Adapter contract for the durable message store. Implementations must be
/// thread-safe; the pipeline calls them from many drain tasks at once.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Idempotency probe. Must reflect committed handling only.
    async fn has_command_handled(&self, message_id: &str, consumer_group: &str)
        -> StoreResult<bool>;

    /// Atomic write of the handled-command record plus the outbox rows.
    async fn save_command(
        &self,
        ctx: &MessageContext,
        envelopes: &[OutboundEnvelope],
        result_summary: &str,
    ) -> StoreResult<()>;

    /// Records a failure plus any publish-anyway and reply envelopes.
    /// Runs in its own transaction, separate from the rolled-back attempt.
    async fn save_failed_command(
        &self,
        ctx: &MessageContext,
        failure: &FailureInfo,
        envelopes: &[OutboundEnvelope],
    ) -> StoreResult<()>;

    /// Releases scope-local uncommitted state after a failed attempt.
    /// Handlers may have partially mutated aggregates through a unit of work
    /// living in the same scope.
    async fn rollback(&self, ctx: &MessageContext) -> StoreResult<()>;

    /// Outbox rows not yet published, in insertion order.
    async fn fetch_undispatched(&self, limit: usize) -> StoreResult<Vec<OutboxRecord>>;

    /// Marks outbox rows as published.
    async fn mark_dispatched(&self, envelope_ids: &[String]) -> StoreResult<()>;
}
