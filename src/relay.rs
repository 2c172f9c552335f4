//! Outbox relay.
//!
//! Background sweep that re-publishes durable envelopes the pipeline's direct
//! publish missed. Rows stay pending until a publish succeeds, so overall
//! publish semantics are at-least-once; downstream consumers dedupe by
//! envelope id.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::config::RelayConfig;
use crate::metrics::ConsumerMetrics;
use crate::queue::QueueClient;
use crate::store::MessageStore;

pub struct OutboxRelay {
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn QueueClient>,
    config: RelayConfig,
    metrics: Arc<ConsumerMetrics>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn QueueClient>,
        config: RelayConfig,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            metrics,
        }
    }

    /// Runs the sweep loop until the shutdown signal fires.
    pub fn spawn(self, shutdown: broadcast::Sender<()>) -> JoinHandle<()> {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            info!(
                batch_size = self.config.batch_size,
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                "outbox relay started"
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sleep(self.config.poll_interval) => {}
                }
                self.sweep().await;
            }
            info!("outbox relay stopped");
        })
    }

    async fn sweep(&self) {
        let pending = match self.store.fetch_undispatched(self.config.batch_size).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "outbox fetch failed");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        let envelopes: Vec<_> = pending.iter().map(|record| record.envelope.clone()).collect();
        if let Err(e) = self.queue.publish(&envelopes).await {
            // Leave the rows pending; the next sweep retries them.
            error!(count = pending.len(), error = %e, "relay publish failed");
            self.metrics.inc_publish_failures();
            return;
        }

        let ids: Vec<String> = pending
            .iter()
            .map(|record| record.envelope_id.clone())
            .collect();
        if let Err(e) = self.store.mark_dispatched(&ids).await {
            error!(error = %e, "could not mark relayed rows dispatched");
            return;
        }
        self.metrics.add_relay_dispatched(ids.len() as u64);
        debug!(count = ids.len(), "relayed outbox envelopes");
    }
}
