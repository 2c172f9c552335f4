//! Consumer orchestrator.
//!
//! Owns the lifecycle: subscribes to the queue, feeds contexts into the
//! mailbox scheduler with the pipeline as the drain function, applies
//! backpressure against the full-load threshold, and shuts everything down in
//! order (queue first, then relay, then scheduler) under a deadline.
//!
//! All collaborators arrive through the constructor; there is no global
//! container.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ConsumerConfig;
use crate::mailbox::{DrainFn, MailboxError, MailboxScheduler};
use crate::metrics::ConsumerMetrics;
use crate::pipeline::CommandPipeline;
use crate::queue::{QueueClient, QueueError};
use crate::registry::HandlerRegistry;
use crate::relay::OutboxRelay;
use crate::store::{MessageStore, StoreError};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer is already running")]
    AlreadyRunning,

    #[error("consumer is not running")]
    NotRunning,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] MailboxError),
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;

struct Running {
    scheduler: Arc<MailboxScheduler>,
    ingress: JoinHandle<()>,
    relay: Option<JoinHandle<()>>,
}

pub struct Consumer {
    config: ConsumerConfig,
    queue: Arc<dyn QueueClient>,
    store: Arc<dyn MessageStore>,
    registry: Arc<HandlerRegistry>,
    metrics: Arc<ConsumerMetrics>,
    shutdown_tx: broadcast::Sender<()>,
    running: Mutex<Option<Running>>,
}

impl Consumer {
    pub fn new(
        config: ConsumerConfig,
        queue: Arc<dyn QueueClient>,
        store: Arc<dyn MessageStore>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            registry,
            metrics: Arc::new(ConsumerMetrics::new()),
            shutdown_tx: broadcast::channel(1).0,
            running: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Subscribes and starts the ingress loop, the scheduler, and (when
    /// enabled) the outbox relay.
    pub async fn start(&self) -> ConsumerResult<()> {
        if self.running.lock().expect("consumer state poisoned").is_some() {
            return Err(ConsumerError::AlreadyRunning);
        }

        let pipeline = Arc::new(CommandPipeline::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            self.config.clone(),
            Arc::clone(&self.metrics),
            self.shutdown_tx.clone(),
        ));
        let drain: DrainFn = Arc::new(move |ctx| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                pipeline.consume(ctx).await;
            })
        });
        let scheduler = Arc::new(MailboxScheduler::new(
            self.config.mailbox_batch_count,
            drain,
            Arc::clone(&self.metrics),
        ));

        let mut stream = self
            .queue
            .subscribe(
                &self.config.command_queue,
                &self.config.consumer_group,
                self.config.wait_interval,
            )
            .await?;

        let ingress = {
            let scheduler = Arc::clone(&scheduler);
            let metrics = Arc::clone(&self.metrics);
            let threshold = self.config.full_load_threshold;
            let low_water = self.config.low_water;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    // Backpressure gate before pulling the next context keeps
                    // in-flight bounded no matter how the adapter bursts.
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = scheduler.wait_for_capacity(threshold, low_water) => {}
                    }
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        next = stream.recv() => {
                            let Some(ctx) = next else { break };
                            metrics.inc_messages_consumed();
                            if let Err(e) = scheduler.process(ctx) {
                                warn!(error = %e, "context dropped; it will be redelivered");
                                break;
                            }
                        }
                    }
                }
                info!("ingress loop finished");
            })
        };

        let relay = if self.config.relay.enabled {
            let relay = OutboxRelay::new(
                Arc::clone(&self.store),
                Arc::clone(&self.queue),
                self.config.relay.clone(),
                Arc::clone(&self.metrics),
            );
            Some(relay.spawn(self.shutdown_tx.clone()))
        } else {
            None
        };

        *self.running.lock().expect("consumer state poisoned") = Some(Running {
            scheduler,
            ingress,
            relay,
        });
        info!(
            queue = %self.config.command_queue,
            consumer_group = %self.config.consumer_group,
            "consumer started"
        );
        Ok(())
    }

    /// Stops ingress, then drains in-flight mailboxes under the shutdown
    /// deadline. Contexts that did not finish are redelivered on restart.
    pub async fn stop(&self) -> ConsumerResult<()> {
        let running = self
            .running
            .lock()
            .expect("consumer state poisoned")
            .take()
            .ok_or(ConsumerError::NotRunning)?;

        self.queue.stop().await?;
        // Subscribers may already be gone; that just means nothing is waiting.
        let _ = self.shutdown_tx.send(());

        if let Err(e) = running.ingress.await {
            warn!(error = %e, "ingress task join failed");
        }
        if let Some(relay) = running.relay {
            if let Err(e) = relay.await {
                warn!(error = %e, "relay task join failed");
            }
        }

        let drained = running
            .scheduler
            .shutdown(self.config.shutdown_deadline)
            .await;
        match drained {
            Ok(()) => {
                info!("consumer stopped; all in-flight work drained");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "consumer stopped with undrained work");
                Err(e.into())
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.running
            .lock()
            .expect("consumer state poisoned")
            .as_ref()
            .map(|running| running.scheduler.in_flight())
            .unwrap_or(0)
    }
}
