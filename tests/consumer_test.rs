//! End-to-end consumer tests over the in-memory adapters: queue in,
//! handled-command rows, outbox, published envelopes, and committed offsets
//! out.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;

use mailroom::{
    memory::{InMemoryQueue, InMemoryStore},
    CommandHandler, CommandMessage, CommandPayload, CommandScope, Consumer, ConsumerConfig,
    ConsumerError, DomainEvent, HandlerRegistry, HandlerResult, MessageStore,
};

#[derive(Deserialize)]
struct Step {
    #[serde(default)]
    sleep_ms: u64,
}

/// Sleeps as instructed, raises one ledger event, and records its completion
/// so tests can assert execution order.
struct StepHandler {
    completed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl CommandHandler for StepHandler {
    type Command = Step;

    async fn handle(&self, scope: &CommandScope, command: Step) -> HandlerResult {
        if command.sleep_ms > 0 {
            sleep(Duration::from_millis(command.sleep_ms)).await;
        }
        scope.raise_event(DomainEvent::new(
            "ledger",
            &scope.command().routing_key,
            json!({"handled": scope.command().message_id}),
        ));
        self.completed
            .lock()
            .unwrap()
            .push(scope.command().message_id.clone());
        Ok(())
    }
}

fn command(id: &str, key: &str, sleep_ms: u64) -> CommandMessage {
    CommandMessage {
        message_id: id.to_string(),
        routing_key: key.to_string(),
        payload: CommandPayload::new("Step", json!({"sleep_ms": sleep_ms})),
        reply_endpoint: None,
        saga_info: None,
        need_retry: false,
        producer: "test".to_string(),
    }
}

fn test_config() -> ConsumerConfig {
    let mut config = ConsumerConfig::default();
    config.wait_interval = Duration::from_millis(10);
    config.relay.poll_interval = Duration::from_millis(20);
    config.shutdown_deadline = Duration::from_secs(5);
    config
}

struct Harness {
    queue: Arc<InMemoryQueue>,
    store: Arc<InMemoryStore>,
    consumer: Consumer,
    completed: Arc<Mutex<Vec<String>>>,
}

fn harness(config: ConsumerConfig) -> Harness {
    let queue = Arc::new(InMemoryQueue::new("mailroom", 16));
    let store = Arc::new(InMemoryStore::new());
    let completed = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::new();
    registry.register(
        "Step",
        StepHandler {
            completed: completed.clone(),
        },
    );
    let consumer = Consumer::new(config, queue.clone(), store.clone(), Arc::new(registry));
    Harness {
        queue,
        store,
        consumer,
        completed,
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_end_to_end_happy_path() {
    let h = harness(test_config());
    h.queue.enqueue(command("C1", "A1", 0));

    h.consumer.start().await.unwrap();
    let store = h.store.clone();
    eventually("command to be handled", || store.handled("C1", "mailroom").is_some()).await;

    let queue = h.queue.clone();
    eventually("offset commit", || queue.committed("A1") == Some(0)).await;
    assert_eq!(h.queue.published().len(), 1);
    assert_eq!(h.consumer.metrics().snapshot().messages_consumed_total, 1);

    h.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_same_key_commands_complete_in_delivery_order() {
    let h = harness(test_config());
    // C4 sleeps; C5 must still wait for it.
    h.queue.enqueue(command("C4", "K", 100));
    h.queue.enqueue(command("C5", "K", 0));

    h.consumer.start().await.unwrap();
    let store = h.store.clone();
    eventually("both commands handled", || store.handled_count() == 2).await;
    h.consumer.stop().await.unwrap();

    assert_eq!(*h.completed.lock().unwrap(), vec!["C4", "C5"]);
    let c4 = h.store.handled("C4", "mailroom").unwrap();
    let c5 = h.store.handled("C5", "mailroom").unwrap();
    assert!(c4.handled_at < c5.handled_at);
}

#[tokio::test]
async fn test_distinct_keys_run_concurrently() {
    let h = harness(test_config());
    h.queue.enqueue(command("SLOW", "K1", 150));
    h.queue.enqueue(command("FAST", "K2", 0));

    h.consumer.start().await.unwrap();
    let store = h.store.clone();
    eventually("both commands handled", || store.handled_count() == 2).await;
    h.consumer.stop().await.unwrap();

    // The fast key did not queue behind the slow one.
    assert_eq!(*h.completed.lock().unwrap(), vec!["FAST", "SLOW"]);
}

#[tokio::test]
async fn test_duplicate_redelivery_is_effectively_once() {
    let h = harness(test_config());
    h.queue.enqueue(command("C1", "K", 0));
    h.queue.enqueue(command("C1", "K", 0));

    h.consumer.start().await.unwrap();
    let queue = h.queue.clone();
    eventually("both deliveries settled", || queue.committed("K") == Some(1)).await;
    h.consumer.stop().await.unwrap();

    assert_eq!(h.store.handled_count(), 1);
    assert_eq!(h.completed.lock().unwrap().len(), 1);
    assert_eq!(h.consumer.metrics().snapshot().duplicates_total, 1);
    // One ledger event; the duplicate produced no reply (none requested) and
    // no new outbox rows.
    assert_eq!(h.store.outbox_records().len(), 1);
}

#[tokio::test]
async fn test_backpressure_bounds_in_flight_work() {
    let mut config = test_config();
    config.full_load_threshold = 4;
    config.low_water = 2;
    let h = harness(config);

    for i in 0..12 {
        h.queue.enqueue(command(&format!("C{}", i), &format!("K{}", i), 30));
    }

    h.consumer.start().await.unwrap();
    for _ in 0..20 {
        assert!(h.consumer.in_flight() <= 4, "in-flight exceeded the threshold");
        sleep(Duration::from_millis(10)).await;
    }

    let store = h.store.clone();
    eventually("all commands handled", || store.handled_count() == 12).await;
    h.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_relay_republishes_after_transport_failure() {
    let h = harness(test_config());
    h.queue.fail_next_publishes(1);
    h.queue.enqueue(command("C1", "K", 0));

    h.consumer.start().await.unwrap();
    let store = h.store.clone();
    eventually("command handled", || store.handled("C1", "mailroom").is_some()).await;

    // The direct publish failed, so the envelope arrives via the relay.
    let queue = h.queue.clone();
    eventually("relay publish", || !queue.published().is_empty()).await;
    for _ in 0..100 {
        if store.fetch_undispatched(10).await.unwrap().is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(store.fetch_undispatched(10).await.unwrap().is_empty());

    let snapshot = h.consumer.metrics().snapshot();
    assert_eq!(snapshot.publish_failures_total, 1);
    assert!(snapshot.relay_dispatched_total >= 1);

    h.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_commit_order_is_non_decreasing_per_partition() {
    let h = harness(test_config());
    for i in 0..10 {
        h.queue.enqueue(command(&format!("C{}", i), "K", 0));
    }

    h.consumer.start().await.unwrap();
    let store = h.store.clone();
    eventually("all commands handled", || store.handled_count() == 10).await;
    let queue = h.queue.clone();
    eventually("all offsets committed", || {
        queue.commit_history("K").len() == 10
    })
    .await;
    h.consumer.stop().await.unwrap();

    let history = h.queue.commit_history("K");
    assert_eq!(history, (0..10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_stop_drains_in_flight_work_and_rejects_double_stop() {
    let h = harness(test_config());
    h.queue.enqueue(command("C1", "K", 50));
    h.queue.enqueue(command("C2", "K", 50));

    h.consumer.start().await.unwrap();
    sleep(Duration::from_millis(20)).await;

    h.consumer.stop().await.unwrap();

    // Whatever was admitted before the stop finished cleanly; nothing is
    // half-done.
    let handled = h.store.handled_count();
    assert_eq!(h.completed.lock().unwrap().len(), handled);
    assert!(h.queue.commit_history("K").len() == handled);

    let err = h.consumer.stop().await.unwrap_err();
    assert!(matches!(err, ConsumerError::NotRunning));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let h = harness(test_config());
    h.consumer.start().await.unwrap();
    let err = h.consumer.start().await.unwrap_err();
    assert!(matches!(err, ConsumerError::AlreadyRunning));
    h.consumer.stop().await.unwrap();
}
