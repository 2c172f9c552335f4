//! Mailbox scheduler.
//!
//! Routes contexts to per-key mailboxes and drains each mailbox on its own
//! worker task: strictly serial within a key, parallel across keys. A drain
//! task processes at most `batch_count` contexts and then re-queues itself,
//! yielding the worker so one hot key cannot starve the others.
//!
//! The clear-running / re-queue decision is made under the mailbox's map
//! entry, so an enqueue concurrent with the end of a drain either lands in
//! the still-running mailbox (the drain sees it and re-queues) or finds the
//! entry gone and starts a fresh one. No wakeup is lost and at most one drain
//! task per key is ever executing.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::message::MessageContext;
use crate::metrics::ConsumerMetrics;

/// What a drain step runs for each context. The future must absorb its own
/// errors; the scheduler only guards against panics.
pub type DrainFn =
    Arc<dyn Fn(MessageContext) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum MailboxError {
    /// The scheduler no longer accepts work; the context will be redelivered.
    #[error("mailbox scheduler is shutting down")]
    ShuttingDown,

    #[error("shutdown deadline exceeded with {in_flight} contexts in flight")]
    ShutdownTimeout { in_flight: usize },
}

#[derive(Default)]
struct Mailbox {
    queue: VecDeque<MessageContext>,
    running: bool,
}

pub struct MailboxScheduler {
    mailboxes: DashMap<String, Mailbox>,
    drain: DrainFn,
    batch_count: usize,
    in_flight: AtomicUsize,
    settled: Notify,
    accepting: AtomicBool,
    metrics: Arc<ConsumerMetrics>,
}

impl MailboxScheduler {
    pub fn new(batch_count: usize, drain: DrainFn, metrics: Arc<ConsumerMetrics>) -> Self {
        Self {
            mailboxes: DashMap::new(),
            drain,
            batch_count: batch_count.max(1),
            in_flight: AtomicUsize::new(0),
            settled: Notify::new(),
            accepting: AtomicBool::new(true),
            metrics,
        }
    }

    /// Enqueues a context into its mailbox, starting a drain task if the
    /// mailbox is idle.
    pub fn process(self: &Arc<Self>, ctx: MessageContext) -> Result<(), MailboxError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(MailboxError::ShuttingDown);
        }
        let key = ctx.mailbox_key().to_string();
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.metrics.message_admitted();

        use dashmap::mapref::entry::Entry;
        let start_drain = match self.mailboxes.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let mailbox = occupied.get_mut();
                mailbox.queue.push_back(ctx);
                if mailbox.running {
                    false
                } else {
                    mailbox.running = true;
                    true
                }
            }
            Entry::Vacant(vacant) => {
                let mut mailbox = Mailbox::default();
                mailbox.queue.push_back(ctx);
                mailbox.running = true;
                vacant.insert(mailbox);
                self.metrics.mailbox_opened();
                true
            }
        };

        if start_drain {
            self.spawn_drain(key);
        }
        Ok(())
    }

    fn spawn_drain(self: &Arc<Self>, key: String) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.drain_mailbox(key).await;
        });
    }

    async fn drain_mailbox(self: Arc<Self>, key: String) {
        for _ in 0..self.batch_count {
            let next = self
                .mailboxes
                .get_mut(&key)
                .and_then(|mut mailbox| mailbox.queue.pop_front());
            let Some(ctx) = next else { break };

            let message_id = ctx.message.message_id.clone();
            let fut = (self.drain)(ctx);
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                error!(
                    mailbox = %key,
                    message_id = %message_id,
                    panic = %panic_message(&panic),
                    "drain step panicked; continuing with next context"
                );
            }
            self.settle();
        }

        // Decide under the entry whether to yield-and-requeue or to close the
        // drained mailbox. A concurrent enqueue serializes against this.
        use dashmap::mapref::entry::Entry;
        let requeue = match self.mailboxes.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                if occupied.get().queue.is_empty() {
                    occupied.remove();
                    self.metrics.mailbox_closed();
                    false
                } else {
                    true
                }
            }
            Entry::Vacant(_) => false,
        };

        if requeue {
            debug!(mailbox = %key, "batch exhausted; re-queueing drain task");
            self.spawn_drain(key);
        }
    }

    fn settle(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.metrics.message_settled();
        self.settled.notify_waiters();
    }

    /// Contexts enqueued or executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn active_mailboxes(&self) -> usize {
        self.mailboxes.len()
    }

    /// Backpressure gate. Returns immediately below `threshold`; once the
    /// threshold is reached, waits until in-flight falls below
    /// `threshold - low_water` (hysteresis) before admitting more work.
    pub async fn wait_for_capacity(&self, threshold: usize, low_water: usize) {
        if self.in_flight() < threshold {
            return;
        }
        let resume_below = threshold.saturating_sub(low_water).max(1);
        loop {
            let notified = self.settled.notified();
            if self.in_flight() < resume_below {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting new contexts and waits for the in-flight ones to
    /// drain, bounded by `deadline`. Contexts still pending afterwards were
    /// never offset-committed and will be redelivered.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), MailboxError> {
        self.accepting.store(false, Ordering::Release);
        match tokio::time::timeout(deadline, self.wait_idle()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(MailboxError::ShutdownTimeout {
                in_flight: self.in_flight(),
            }),
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.settled.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
