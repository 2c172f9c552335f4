use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::consumer::{ConsumerError, ConsumerResult};

/// Top-level consumer configuration. Every field has a serde default so a
/// partial JSON document (or `Default::default()`) yields a runnable config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Queue the consumer subscribes to.
    #[serde(default = "default_command_queue")]
    pub command_queue: String,

    /// Consumer group; part of the idempotency key.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Upper bound on contexts in flight (enqueued + executing). Ingress
    /// pauses once reached.
    #[serde(default = "default_full_load_threshold")]
    pub full_load_threshold: usize,

    /// Hysteresis margin: ingress resumes below
    /// `full_load_threshold - low_water`.
    #[serde(default = "default_low_water")]
    pub low_water: usize,

    /// Poll cadence hint handed to the queue adapter.
    #[serde(default = "default_wait_interval", with = "duration_ms")]
    pub wait_interval: Duration,

    /// Contexts a mailbox drains before yielding its worker to other keys.
    #[serde(default = "default_mailbox_batch_count")]
    pub mailbox_batch_count: usize,

    /// Per-command handler budget; overruns are non-retryable failures.
    #[serde(default = "default_handler_timeout", with = "duration_ms")]
    pub handler_timeout: Duration,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Bound on draining in-flight mailboxes during `stop`.
    #[serde(default = "default_shutdown_deadline", with = "duration_ms")]
    pub shutdown_deadline: Duration,

    #[serde(default)]
    pub relay: RelayConfig,
}

/// Bounds the optimistic-concurrency retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// First backoff; doubles per attempt.
    #[serde(default = "default_backoff_base", with = "duration_ms")]
    pub backoff_base: Duration,
}

impl RetryConfig {
    /// Exponential backoff before the given retry (1-based attempt count).
    pub fn backoff_for(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        self.backoff_base.saturating_mul(1u32 << shift)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
        }
    }
}

/// Outbox relay: background re-publish of rows the direct publish missed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_relay_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_relay_poll_interval", with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            batch_size: default_relay_batch_size(),
            poll_interval: default_relay_poll_interval(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            command_queue: default_command_queue(),
            consumer_group: default_consumer_group(),
            full_load_threshold: default_full_load_threshold(),
            low_water: default_low_water(),
            wait_interval: default_wait_interval(),
            mailbox_batch_count: default_mailbox_batch_count(),
            handler_timeout: default_handler_timeout(),
            retry: RetryConfig::default(),
            shutdown_deadline: default_shutdown_deadline(),
            relay: RelayConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConsumerResult<Self> {
        let file = File::open(path)
            .map_err(|e| ConsumerError::Config(format!("failed to open config file: {}", e)))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader)
            .map_err(|e| ConsumerError::Config(format!("failed to parse config file: {}", e)))
    }
}

fn default_command_queue() -> String {
    "commands".to_string()
}
fn default_consumer_group() -> String {
    "mailroom".to_string()
}
fn default_full_load_threshold() -> usize {
    1000
}
fn default_low_water() -> usize {
    100
}
fn default_wait_interval() -> Duration {
    Duration::from_millis(1000)
}
fn default_mailbox_batch_count() -> usize {
    100
}
fn default_handler_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_max_attempts() -> usize {
    5
}
fn default_backoff_base() -> Duration {
    Duration::from_millis(50)
}
fn default_shutdown_deadline() -> Duration {
    Duration::from_secs(30)
}
fn default_true() -> bool {
    true
}
fn default_relay_batch_size() -> usize {
    50
}
fn default_relay_poll_interval() -> Duration {
    Duration::from_millis(500)
}

pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
