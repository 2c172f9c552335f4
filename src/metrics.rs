//! In-process observability counters.
//!
//! Plain atomics with a `snapshot()` view; there is no metrics endpoint here,
//! the host scrapes or logs the snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    messages_consumed_total: AtomicU64,
    duplicates_total: AtomicU64,
    no_handler_total: AtomicU64,
    optimistic_concurrency_retries_total: AtomicU64,
    handler_failures_domain_total: AtomicU64,
    handler_failures_system_total: AtomicU64,
    envelopes_published_total: AtomicU64,
    publish_failures_total: AtomicU64,
    relay_dispatched_total: AtomicU64,

    mailboxes_active: AtomicU64,
    in_flight_messages: AtomicU64,

    handler_duration_count: AtomicU64,
    handler_duration_sum_micros: AtomicU64,
    handler_duration_max_micros: AtomicU64,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_messages_consumed(&self) {
        self.messages_consumed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicates(&self) {
        self.duplicates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_no_handler(&self) {
        self.no_handler_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_concurrency_retries(&self) {
        self.optimistic_concurrency_retries_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_domain_failures(&self) {
        self.handler_failures_domain_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_system_failures(&self) {
        self.handler_failures_system_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_envelopes_published(&self, count: u64) {
        self.envelopes_published_total
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_publish_failures(&self) {
        self.publish_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_relay_dispatched(&self, count: u64) {
        self.relay_dispatched_total
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn mailbox_opened(&self) {
        self.mailboxes_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mailbox_closed(&self) {
        self.mailboxes_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_admitted(&self) {
        self.in_flight_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_settled(&self) {
        self.in_flight_messages.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn observe_handler_duration(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.handler_duration_count.fetch_add(1, Ordering::Relaxed);
        self.handler_duration_sum_micros
            .fetch_add(micros, Ordering::Relaxed);
        self.handler_duration_max_micros
            .fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_consumed_total: self.messages_consumed_total.load(Ordering::Relaxed),
            duplicates_total: self.duplicates_total.load(Ordering::Relaxed),
            no_handler_total: self.no_handler_total.load(Ordering::Relaxed),
            optimistic_concurrency_retries_total: self
                .optimistic_concurrency_retries_total
                .load(Ordering::Relaxed),
            handler_failures_domain_total: self
                .handler_failures_domain_total
                .load(Ordering::Relaxed),
            handler_failures_system_total: self
                .handler_failures_system_total
                .load(Ordering::Relaxed),
            envelopes_published_total: self.envelopes_published_total.load(Ordering::Relaxed),
            publish_failures_total: self.publish_failures_total.load(Ordering::Relaxed),
            relay_dispatched_total: self.relay_dispatched_total.load(Ordering::Relaxed),
            mailboxes_active: self.mailboxes_active.load(Ordering::Relaxed),
            in_flight_messages: self.in_flight_messages.load(Ordering::Relaxed),
            handler_duration_count: self.handler_duration_count.load(Ordering::Relaxed),
            handler_duration_sum_micros: self.handler_duration_sum_micros.load(Ordering::Relaxed),
            handler_duration_max_micros: self.handler_duration_max_micros.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_consumed_total: u64,
    pub duplicates_total: u64,
    pub no_handler_total: u64,
    pub optimistic_concurrency_retries_total: u64,
    pub handler_failures_domain_total: u64,
    pub handler_failures_system_total: u64,
    pub envelopes_published_total: u64,
    pub publish_failures_total: u64,
    pub relay_dispatched_total: u64,
    pub mailboxes_active: u64,
    pub in_flight_messages: u64,
    pub handler_duration_count: u64,
    pub handler_duration_sum_micros: u64,
    pub handler_duration_max_micros: u64,
}

impl MetricsSnapshot {
    pub fn average_handler_duration(&self) -> Duration {
        if self.handler_duration_count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.handler_duration_sum_micros / self.handler_duration_count)
    }
}
