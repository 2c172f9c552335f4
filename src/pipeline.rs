//! The command pipeline.
//!
//! One call per inbound context, always run from a mailbox drain step:
//! type gate → idempotency probe → handler resolution → timed execution in a
//! fresh scope → envelope collection → atomic save → publish → offset commit.
//! Optimistic-concurrency conflicts retry with exponential backoff when the
//! command opts in; every other failure is recorded in its own transaction
//! together with the publish-anyway and reply envelopes.
//!
//! Nothing escapes: the pipeline absorbs and logs every error so the drain
//! loop above it never observes one.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::event_bus::EventBatch;
use crate::message::{MessageContext, OutboundEnvelope, ReplyPayload};
use crate::metrics::ConsumerMetrics;
use crate::queue::QueueClient;
use crate::registry::{HandlerError, HandlerRegistry, Registration};
use crate::scope::CommandScope;
use crate::store::{FailureInfo, FailureKind, MessageStore, StoreError};

pub struct CommandPipeline {
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn QueueClient>,
    config: ConsumerConfig,
    metrics: Arc<ConsumerMetrics>,
    shutdown: broadcast::Sender<()>,
}

impl CommandPipeline {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn QueueClient>,
        config: ConsumerConfig,
        metrics: Arc<ConsumerMetrics>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            config,
            metrics,
            shutdown,
        }
    }

    /// Consumes one context end to end, committing its offset once the
    /// outcome is durable (or the context turned out to need no handling).
    #[tracing::instrument(
        skip_all,
        fields(
            message_id = %ctx.message.message_id,
            mailbox = %ctx.mailbox_key(),
        )
    )]
    pub async fn consume(&self, ctx: MessageContext) {
        // Non-command messages on the command queue are poison, not fatal.
        if !ctx.message.payload.is_command() {
            warn!("payload carries no command type; skipping");
            self.commit(&ctx).await;
            return;
        }

        match self
            .store
            .has_command_handled(&ctx.message.message_id, &ctx.consumer_group)
            .await
        {
            Ok(true) => {
                self.metrics.inc_duplicates();
                debug!("duplicate delivery");
                let envelopes = self.reply_only(&ctx, ReplyPayload::MessageDuplicatelyHandled);
                self.publish(&ctx, &envelopes, false).await;
                self.commit(&ctx).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                // Without a probe result nothing is safe; leave the offset
                // uncommitted so the queue redelivers.
                error!(error = %e, "idempotency probe failed; offset left uncommitted");
                return;
            }
        }

        let Some(registration) = self.registry.resolve(&ctx.message.payload.type_name) else {
            self.metrics.inc_no_handler();
            warn!(
                command_type = %ctx.message.payload.type_name,
                "no handler registered"
            );
            let envelopes = self.reply_only(&ctx, ReplyPayload::NoHandlerExists);
            self.publish(&ctx, &envelopes, false).await;
            self.commit(&ctx).await;
            return;
        };

        let envelopes = self.execute(&ctx, &registration).await;
        self.publish(&ctx, &envelopes, true).await;
        self.commit(&ctx).await;
    }

    /// Runs the handler (with retry on opted-in conflicts) and persists the
    /// outcome. Returns whatever envelopes became durable.
    async fn execute(
        &self,
        ctx: &MessageContext,
        registration: &Registration,
    ) -> Vec<OutboundEnvelope> {
        let scope = Arc::new(CommandScope::new(
            ctx.message.clone(),
            Arc::clone(&self.store),
            self.shutdown.clone(),
        ));
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let invoked = (registration.invoke)(
                Arc::clone(&scope),
                ctx.message.payload.body.clone(),
            );
            let result = match timeout(self.config.handler_timeout, invoked).await {
                Ok(result) => result,
                Err(_) => Err(HandlerError::System(format!(
                    "handler timed out after {:?}",
                    self.config.handler_timeout
                ))),
            };
            self.metrics.observe_handler_duration(started.elapsed());

            match result {
                Ok(()) => {
                    let batch = scope.event_bus().snapshot();
                    let reply = scope.take_reply();
                    let (envelopes, summary) = self.build_success_envelopes(ctx, reply, &batch);

                    match self.store.save_command(ctx, &envelopes, &summary).await {
                        Ok(()) => {
                            info!(attempt, summary = %summary, "command handled");
                            return envelopes;
                        }
                        Err(StoreError::Concurrency(msg))
                            if ctx.message.need_retry && attempt < max_attempts =>
                        {
                            self.metrics.inc_concurrency_retries();
                            debug!(attempt, conflict = %msg, "save conflicted; retrying");
                            scope.event_bus().clear_messages();
                            sleep(self.config.retry.backoff_for(attempt)).await;
                        }
                        Err(e) => {
                            return self
                                .record_failure(ctx, HandlerError::from(e), batch, attempt)
                                .await;
                        }
                    }
                }
                Err(HandlerError::Concurrency(msg))
                    if ctx.message.need_retry && attempt < max_attempts =>
                {
                    self.metrics.inc_concurrency_retries();
                    debug!(attempt, conflict = %msg, "handler conflicted; retrying");
                    scope.event_bus().clear_messages();
                    sleep(self.config.retry.backoff_for(attempt)).await;
                }
                Err(e) => {
                    let batch = scope.event_bus().snapshot();
                    return self.record_failure(ctx, e, batch, attempt).await;
                }
            }
        }
    }

    /// Failure path: rollback, failure reply, publish-anyway and saga
    /// envelopes, then the failure record in its own transaction.
    async fn record_failure(
        &self,
        ctx: &MessageContext,
        failure: HandlerError,
        batch: EventBatch,
        attempt: usize,
    ) -> Vec<OutboundEnvelope> {
        let info = classify(ctx, &failure, attempt);

        if let Err(e) = self.store.rollback(ctx).await {
            warn!(error = %e, "rollback reported an error");
        }

        let mut envelopes = Vec::new();
        if let Some(endpoint) = ctx.message.reply_endpoint.as_deref().filter(|e| !e.is_empty()) {
            envelopes.push(self.queue.wrap_reply(
                ctx,
                endpoint,
                ReplyPayload::FailureReply {
                    exception_type: info.kind.to_string(),
                    message: info.message.clone(),
                },
            ));
        }
        // Success events are discarded; publish-anyway and saga replies
        // survive the failure.
        for event in batch.publish_anyway {
            envelopes.push(self.queue.wrap_event(ctx, event));
        }
        if let Some(target) = ctx
            .message
            .saga_info
            .as_ref()
            .and_then(|saga| saga.reply_target())
        {
            for result in batch.saga_results {
                envelopes.push(
                    self.queue
                        .wrap_reply(ctx, target, ReplyPayload::HandlerReply(result)),
                );
            }
        }

        match info.kind {
            FailureKind::System => {
                self.metrics.inc_system_failures();
                error!(attempt, error = %info.message, "command failed");
            }
            FailureKind::Domain => {
                self.metrics.inc_domain_failures();
                warn!(attempt, error = %info.message, "command rejected");
            }
        }

        if let Err(e) = self.store.save_failed_command(ctx, &info, &envelopes).await {
            error!(error = %e, "failed to record failed command");
        }
        envelopes
    }

    fn build_success_envelopes(
        &self,
        ctx: &MessageContext,
        reply: Option<serde_json::Value>,
        batch: &EventBatch,
    ) -> (Vec<OutboundEnvelope>, String) {
        let mut envelopes = Vec::new();
        let mut reply_count = 0;

        if let Some(endpoint) = ctx.message.reply_endpoint.as_deref().filter(|e| !e.is_empty()) {
            let value = reply.unwrap_or(serde_json::Value::Null);
            envelopes.push(
                self.queue
                    .wrap_reply(ctx, endpoint, ReplyPayload::HandlerReply(value)),
            );
            reply_count = 1;
        }
        for event in &batch.events {
            envelopes.push(self.queue.wrap_event(ctx, event.clone()));
        }
        for event in &batch.publish_anyway {
            envelopes.push(self.queue.wrap_event(ctx, event.clone()));
        }
        let mut saga_count = 0;
        if let Some(target) = ctx
            .message
            .saga_info
            .as_ref()
            .and_then(|saga| saga.reply_target())
        {
            for result in &batch.saga_results {
                envelopes.push(self.queue.wrap_reply(
                    ctx,
                    target,
                    ReplyPayload::HandlerReply(result.clone()),
                ));
                saga_count += 1;
            }
        }

        let summary = format!(
            "events={} publish_anyway={} replies={} saga_replies={}",
            batch.events.len(),
            batch.publish_anyway.len(),
            reply_count,
            saga_count
        );
        (envelopes, summary)
    }

    fn reply_only(&self, ctx: &MessageContext, payload: ReplyPayload) -> Vec<OutboundEnvelope> {
        match ctx.message.reply_endpoint.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => vec![self.queue.wrap_reply(ctx, endpoint, payload)],
            None => Vec::new(),
        }
    }

    /// Best-effort transport send. Durable envelopes that made it out are
    /// marked dispatched; the ones that did not stay pending for the relay.
    async fn publish(&self, ctx: &MessageContext, envelopes: &[OutboundEnvelope], durable: bool) {
        if envelopes.is_empty() {
            return;
        }
        match self.queue.publish(envelopes).await {
            Ok(()) => {
                self.metrics.add_envelopes_published(envelopes.len() as u64);
                if durable {
                    let ids: Vec<String> = envelopes
                        .iter()
                        .map(|e| e.envelope_id().to_string())
                        .collect();
                    if let Err(e) = self.store.mark_dispatched(&ids).await {
                        warn!(error = %e, "could not mark outbox rows dispatched");
                    }
                }
            }
            Err(e) => {
                self.metrics.inc_publish_failures();
                error!(
                    message_id = %ctx.message.message_id,
                    error = %e,
                    "publish failed; durable envelopes stay in the outbox"
                );
            }
        }
    }

    /// Unconditional once the outcome is durable: the outbox is the source
    /// of truth, so transport health never holds the queue offset hostage.
    async fn commit(&self, ctx: &MessageContext) {
        if let Err(e) = self.queue.commit_offset(ctx).await {
            error!(
                message_id = %ctx.message.message_id,
                error = %e,
                "offset commit failed"
            );
        }
    }
}

fn classify(ctx: &MessageContext, failure: &HandlerError, attempt: usize) -> FailureInfo {
    match failure {
        HandlerError::Domain(msg) => FailureInfo::new(FailureKind::Domain, msg.clone()),
        HandlerError::Concurrency(msg) => {
            if ctx.message.need_retry {
                // The retry budget is spent; a conflict that survives the cap
                // is an infrastructure problem, not a business outcome.
                FailureInfo::new(
                    FailureKind::System,
                    format!("conflict persisted after {} attempts: {}", attempt, msg),
                )
            } else {
                // A conflict the command did not opt to retry is recorded
                // like any other rejected command.
                FailureInfo::new(FailureKind::Domain, msg.clone())
            }
        }
        HandlerError::System(msg) => FailureInfo::new(FailureKind::System, msg.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryQueue, InMemoryStore};
    use crate::message::{CommandMessage, CommandPayload, Offset};
    use chrono::Utc;
    use serde_json::json;

    fn pipeline(
        registry: Arc<HandlerRegistry>,
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryQueue>,
    ) -> CommandPipeline {
        CommandPipeline::new(
            registry,
            store,
            queue,
            ConsumerConfig::default(),
            Arc::new(ConsumerMetrics::new()),
            broadcast::channel(1).0,
        )
    }

    fn context(payload: CommandPayload) -> MessageContext {
        MessageContext {
            message: CommandMessage {
                message_id: "C1".to_string(),
                routing_key: "K".to_string(),
                payload,
                reply_endpoint: None,
                saga_info: None,
                need_retry: false,
                producer: "test".to_string(),
            },
            offset: Offset {
                partition: "K".to_string(),
                value: 0,
            },
            consumer_group: "g".to_string(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_non_command_payload_commits_and_skips() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new("test", 16));
        let pipeline = pipeline(Arc::new(HandlerRegistry::new()), store.clone(), queue.clone());

        pipeline
            .consume(context(CommandPayload::new("", json!(null))))
            .await;

        assert_eq!(queue.committed("K"), Some(0));
        assert_eq!(store.handled_count(), 0);
        assert!(store.failed_records().is_empty());
    }

    #[tokio::test]
    async fn test_no_handler_without_reply_endpoint_publishes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new("test", 16));
        let pipeline = pipeline(Arc::new(HandlerRegistry::new()), store.clone(), queue.clone());

        pipeline
            .consume(context(CommandPayload::new("Unknown", json!({}))))
            .await;

        assert!(queue.published().is_empty());
        assert_eq!(queue.committed("K"), Some(0));
        assert_eq!(store.handled_count(), 0);
    }
}
