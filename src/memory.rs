//! In-memory adapters for tests, examples, and local runs.
//!
//! [`InMemoryQueue`] partitions by routing key (so per-key delivery order and
//! offset-commit alignment come for free) and exposes failure injectors for
//! the publish path. [`InMemoryStore`] gives single-lock atomicity for
//! `save_command` and a scriptable optimistic-concurrency injector so the
//! retry path is testable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;
use tracing::debug;

use crate::message::{CommandMessage, MessageContext, Offset, OutboundEnvelope};
use crate::queue::{CommandStream, QueueClient, QueueError, QueueResult};
use crate::store::{
    FailedCommandRecord, FailureInfo, HandledCommandRecord, MessageStore, OutboxRecord,
    StoreError, StoreResult,
};

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<(CommandMessage, Offset)>,
    next_offsets: HashMap<String, u64>,
}

/// In-memory queue client. One partition per routing key.
pub struct InMemoryQueue {
    producer: String,
    buffer: usize,
    inner: Arc<Mutex<QueueInner>>,
    arrivals: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    published: Arc<Mutex<Vec<OutboundEnvelope>>>,
    fail_publishes: Arc<AtomicUsize>,
    commits: Arc<Mutex<HashMap<String, Vec<u64>>>>,
}

impl InMemoryQueue {
    pub fn new(producer: impl Into<String>, buffer: usize) -> Self {
        Self {
            producer: producer.into(),
            buffer: buffer.max(1),
            inner: Arc::new(Mutex::new(QueueInner::default())),
            arrivals: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            published: Arc::new(Mutex::new(Vec::new())),
            fail_publishes: Arc::new(AtomicUsize::new(0)),
            commits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Appends a command to its partition's log. May be called before or
    /// after `subscribe`.
    pub fn enqueue(&self, message: CommandMessage) {
        let partition = if message.routing_key.is_empty() {
            message.message_id.clone()
        } else {
            message.routing_key.clone()
        };
        {
            let mut inner = self.inner.lock().expect("queue poisoned");
            let next = inner.next_offsets.entry(partition.clone()).or_insert(0);
            let offset = Offset {
                partition,
                value: *next,
            };
            *next += 1;
            inner.pending.push_back((message, offset));
        }
        self.arrivals.notify_waiters();
    }

    /// Everything published so far, in publish order.
    pub fn published(&self) -> Vec<OutboundEnvelope> {
        self.published.lock().expect("queue poisoned").clone()
    }

    /// Fails the next `n` publish calls with a transport error.
    pub fn fail_next_publishes(&self, n: usize) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Highest committed offset on a partition, if any.
    pub fn committed(&self, partition: &str) -> Option<u64> {
        self.commits
            .lock()
            .expect("queue poisoned")
            .get(partition)
            .and_then(|history| history.iter().max().copied())
    }

    /// Commit calls observed on a partition, in call order.
    pub fn commit_history(&self, partition: &str) -> Vec<u64> {
        self.commits
            .lock()
            .expect("queue poisoned")
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    fn producer(&self) -> &str {
        &self.producer
    }

    async fn subscribe(
        &self,
        _queue: &str,
        consumer_group: &str,
        wait_interval: Duration,
    ) -> QueueResult<CommandStream> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }
        let (tx, rx) = mpsc::channel(self.buffer);
        let inner = self.inner.clone();
        let arrivals = self.arrivals.clone();
        let stopped = self.stopped.clone();
        let group = consumer_group.to_string();

        tokio::spawn(async move {
            loop {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let next = inner.lock().expect("queue poisoned").pending.pop_front();
                match next {
                    Some((message, offset)) => {
                        let ctx = MessageContext {
                            message,
                            offset,
                            consumer_group: group.clone(),
                            received_at: Utc::now(),
                        };
                        // A full channel blocks here: that is the adapter
                        // pausing its polling under consumer saturation.
                        if tx.send(ctx).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = arrivals.notified() => {}
                            _ = sleep(wait_interval) => {}
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn commit_offset(&self, ctx: &MessageContext) -> QueueResult<()> {
        self.commits
            .lock()
            .expect("queue poisoned")
            .entry(ctx.offset.partition.clone())
            .or_default()
            .push(ctx.offset.value);
        Ok(())
    }

    async fn publish(&self, envelopes: &[OutboundEnvelope]) -> QueueResult<()> {
        let remaining = self.fail_publishes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_publishes.store(remaining - 1, Ordering::SeqCst);
            return Err(QueueError::Publish("injected publish failure".to_string()));
        }
        self.published
            .lock()
            .expect("queue poisoned")
            .extend_from_slice(envelopes);
        Ok(())
    }

    async fn stop(&self) -> QueueResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.arrivals.notify_waiters();
        Ok(())
    }
}

#[derive(Default)]
struct StoreInner {
    handled: HashMap<(String, String), HandledCommandRecord>,
    outbox: Vec<OutboxRecord>,
    failed: Vec<FailedCommandRecord>,
    next_seq: u64,
}

impl StoreInner {
    fn append_outbox(&mut self, source_command_id: &str, envelopes: &[OutboundEnvelope]) {
        for envelope in envelopes {
            let record = OutboxRecord {
                envelope_id: envelope.envelope_id().to_string(),
                seq: self.next_seq,
                source_command_id: source_command_id.to_string(),
                envelope: envelope.clone(),
                created_at: Utc::now(),
                dispatched_at: None,
            };
            self.next_seq += 1;
            self.outbox.push(record);
        }
    }
}

/// In-memory message store. All writes go through one lock, which is the
/// single-transaction guarantee in miniature.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
    conflicts: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` `save_command` calls with an
    /// optimistic-concurrency conflict.
    pub fn fail_next_saves(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    pub fn handled(&self, message_id: &str, consumer_group: &str) -> Option<HandledCommandRecord> {
        self.inner
            .lock()
            .expect("store poisoned")
            .handled
            .get(&(message_id.to_string(), consumer_group.to_string()))
            .cloned()
    }

    pub fn handled_count(&self) -> usize {
        self.inner.lock().expect("store poisoned").handled.len()
    }

    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.inner.lock().expect("store poisoned").outbox.clone()
    }

    pub fn failed_records(&self) -> Vec<FailedCommandRecord> {
        self.inner.lock().expect("store poisoned").failed.clone()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn has_command_handled(
        &self,
        message_id: &str,
        consumer_group: &str,
    ) -> StoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .expect("store poisoned")
            .handled
            .contains_key(&(message_id.to_string(), consumer_group.to_string())))
    }

    async fn save_command(
        &self,
        ctx: &MessageContext,
        envelopes: &[OutboundEnvelope],
        result_summary: &str,
    ) -> StoreResult<()> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Concurrency(
                "injected version conflict".to_string(),
            ));
        }

        let message_id = ctx.message.message_id.clone();
        let mut inner = self.inner.lock().expect("store poisoned");
        let key = (message_id.clone(), ctx.consumer_group.clone());
        if inner.handled.contains_key(&key) {
            return Err(StoreError::DuplicateCommand { message_id });
        }
        inner.handled.insert(
            key,
            HandledCommandRecord {
                message_id: message_id.clone(),
                consumer_group: ctx.consumer_group.clone(),
                handled_at: Utc::now(),
                result_summary: result_summary.to_string(),
            },
        );
        inner.append_outbox(&message_id, envelopes);
        Ok(())
    }

    async fn save_failed_command(
        &self,
        ctx: &MessageContext,
        failure: &FailureInfo,
        envelopes: &[OutboundEnvelope],
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.failed.push(FailedCommandRecord {
            message_id: ctx.message.message_id.clone(),
            consumer_group: ctx.consumer_group.clone(),
            error_type: failure.kind.to_string(),
            error_message: failure.message.clone(),
            failed_at: Utc::now(),
        });
        inner.append_outbox(&ctx.message.message_id, envelopes);
        Ok(())
    }

    async fn rollback(&self, ctx: &MessageContext) -> StoreResult<()> {
        // No scope-local staged state in this adapter; the failed attempt
        // never reached the shared maps.
        debug!(message_id = %ctx.message.message_id, "rollback: nothing staged");
        Ok(())
    }

    async fn fetch_undispatched(&self, limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        Ok(self
            .inner
            .lock()
            .expect("store poisoned")
            .outbox
            .iter()
            .filter(|record| record.dispatched_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_dispatched(&self, envelope_ids: &[String]) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let now = Utc::now();
        for record in inner.outbox.iter_mut() {
            if record.dispatched_at.is_none()
                && envelope_ids.iter().any(|id| id == &record.envelope_id)
            {
                record.dispatched_at = Some(now);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CommandPayload;
    use crate::store::FailureKind;
    use serde_json::json;

    fn message(id: &str, key: &str) -> CommandMessage {
        CommandMessage {
            message_id: id.to_string(),
            routing_key: key.to_string(),
            payload: CommandPayload::new("Test", json!({})),
            reply_endpoint: None,
            saga_info: None,
            need_retry: false,
            producer: "test".to_string(),
        }
    }

    fn context(id: &str, key: &str) -> MessageContext {
        MessageContext {
            message: message(id, key),
            offset: Offset {
                partition: key.to_string(),
                value: 0,
            },
            consumer_group: "g".to_string(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_queue_delivers_per_partition_offsets_in_order() {
        let queue = InMemoryQueue::new("test", 16);
        queue.enqueue(message("C1", "K"));
        queue.enqueue(message("C2", "K"));
        queue.enqueue(message("C3", "other"));

        let mut stream = queue
            .subscribe("commands", "g", Duration::from_millis(10))
            .await
            .unwrap();

        let first = stream.recv().await.unwrap();
        let second = stream.recv().await.unwrap();
        let third = stream.recv().await.unwrap();
        assert_eq!(first.message.message_id, "C1");
        assert_eq!(first.offset.value, 0);
        assert_eq!(second.offset.value, 1);
        assert_eq!(second.offset.partition, "K");
        assert_eq!(third.offset.value, 0);
        assert_eq!(third.offset.partition, "other");

        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_stop_ends_the_stream() {
        let queue = InMemoryQueue::new("test", 16);
        let mut stream = queue
            .subscribe("commands", "g", Duration::from_millis(10))
            .await
            .unwrap();
        queue.stop().await.unwrap();
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_injection() {
        let queue = InMemoryQueue::new("test", 16);
        queue.fail_next_publishes(1);
        let err = queue.publish(&[]).await.unwrap_err();
        assert!(matches!(err, QueueError::Publish(_)));
        queue.publish(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_save_command_is_idempotent_guarded() {
        let store = InMemoryStore::new();
        let ctx = context("C1", "K");
        store.save_command(&ctx, &[], "ok").await.unwrap();
        assert!(store.has_command_handled("C1", "g").await.unwrap());

        let err = store.save_command(&ctx, &[], "ok").await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCommand { .. }));
        assert_eq!(store.handled_count(), 1);
    }

    #[tokio::test]
    async fn test_store_conflict_injection_then_success() {
        let store = InMemoryStore::new();
        store.fail_next_saves(1);
        let ctx = context("C1", "K");

        let err = store.save_command(&ctx, &[], "ok").await.unwrap_err();
        assert!(matches!(err, StoreError::Concurrency(_)));

        store.save_command(&ctx, &[], "ok").await.unwrap();
        assert!(store.has_command_handled("C1", "g").await.unwrap());
    }

    #[tokio::test]
    async fn test_outbox_sequence_and_dispatch_marking() {
        let store = InMemoryStore::new();
        let queue = InMemoryQueue::new("test", 16);
        let ctx = context("C1", "K");
        let envelopes = vec![
            queue.wrap_reply(&ctx, "R", crate::message::ReplyPayload::HandlerReply(json!(1))),
            queue.wrap_event(
                &ctx,
                crate::message::DomainEvent::new("ledger", "K", json!({})),
            ),
        ];
        store.save_command(&ctx, &envelopes, "ok").await.unwrap();

        let records = store.outbox_records();
        assert_eq!(records.len(), 2);
        assert!(records[0].seq < records[1].seq);

        let pending = store.fetch_undispatched(10).await.unwrap();
        assert_eq!(pending.len(), 2);

        store
            .mark_dispatched(&[records[0].envelope_id.clone()])
            .await
            .unwrap();
        let pending = store.fetch_undispatched(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].envelope_id, records[1].envelope_id);
    }

    #[tokio::test]
    async fn test_failed_command_record() {
        let store = InMemoryStore::new();
        let ctx = context("C1", "K");
        store
            .save_failed_command(
                &ctx,
                &FailureInfo::new(FailureKind::Domain, "insufficient funds"),
                &[],
            )
            .await
            .unwrap();

        let failed = store.failed_records();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_type, "Domain");
        assert_eq!(failed[0].error_message, "insufficient funds");
        // A failure is not an idempotency gate.
        assert!(!store.has_command_handled("C1", "g").await.unwrap());
    }
}
