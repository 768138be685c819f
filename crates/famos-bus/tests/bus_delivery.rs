//! End-to-end delivery semantics: FIFO, crash recovery, retries, DLQ, replay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use famos_bus::{BusConfig, DurableBus, EventHandler, HandlerOutcome};
use famos_types::{Envelope, EventType, QoS, SpaceId, SpaceKind};

//──────────────────────────────────────────────────────────────────────────────
//  Helpers
//──────────────────────────────────────────────────────────────────────────────

fn test_config() -> BusConfig {
    BusConfig {
        base_backoff_ms: 10,
        max_backoff_ms: 50,
        max_retries: 2,
        lag_high_watermark: 10_000,
        default_timeout_ms: 300,
        tap_capacity: 64,
    }
}

fn envelope(topic: &str, key: &str, text: &str) -> Envelope {
    Envelope::builder(
        topic,
        EventType::WriteAccepted,
        SpaceId::new(SpaceKind::Shared, "household").unwrap(),
        "alice",
        "alice-phone",
    )
    .idempotency_key(key)
    .payload(&serde_json::json!({ "text": text }))
    .unwrap()
    .seal(chrono::Utc::now())
    .unwrap()
}

/// Records the idempotency keys it sees, acking everything.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, env: Envelope, _deadline: Duration) -> HandlerOutcome {
        self.seen.lock().await.push(env.idempotency_key.clone());
        HandlerOutcome::Ack
    }
}

/// Acks `ack_until` deliveries, then hangs (simulating a consumer that dies
/// mid-processing when the subscription is aborted).
struct HangAfter {
    ack_until: usize,
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EventHandler for HangAfter {
    async fn handle(&self, env: Envelope, _deadline: Duration) -> HandlerOutcome {
        let mut seen = self.seen.lock().await;
        if seen.len() < self.ack_until {
            seen.push(env.idempotency_key.clone());
            return HandlerOutcome::Ack;
        }
        drop(seen);
        // Hold the delivery open until the task is aborted.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        HandlerOutcome::Ack
    }
}

/// Always nacks with the given retryability.
struct AlwaysNack {
    retryable: bool,
}

#[async_trait]
impl EventHandler for AlwaysNack {
    async fn handle(&self, _env: Envelope, _deadline: Duration) -> HandlerOutcome {
        HandlerOutcome::Nack {
            retryable: self.retryable,
            reason: "synthetic failure".into(),
        }
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F, budget: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < budget {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

//──────────────────────────────────────────────────────────────────────────────
//  Tests
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delivers_in_fifo_order() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(DurableBus::open(dir.path(), test_config()).unwrap());

    for key in ["a", "b", "c", "d"] {
        bus.publish(envelope("t", key, key)).await.unwrap();
    }
    let recorder = Arc::new(Recorder::default());
    let sub = bus.subscribe("g", "t", recorder.clone()).unwrap();

    let rec = recorder.clone();
    assert!(
        wait_for(
            || rec.seen.try_lock().map(|s| s.len() == 4).unwrap_or(false),
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(*recorder.seen.lock().await, vec!["a", "b", "c", "d"]);
    assert_eq!(bus.committed("g", "t").unwrap(), Some(3));
    sub.shutdown().await;
}

#[tokio::test]
async fn crash_before_ack_redelivers_from_the_unacked_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.max_retries = 1_000;
    let bus = Arc::new(DurableBus::open(dir.path(), config).unwrap());

    for key in ["a", "b", "c"] {
        bus.publish(envelope("t", key, key)).await.unwrap();
    }

    // Keep retries effectively unlimited so the abort below always lands
    // before the poison path could dead-letter `b`.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let crasher = Arc::new(HangAfter {
        ack_until: 1,
        seen: seen.clone(),
    });
    let sub = bus.subscribe("g", "t", crasher).unwrap();
    {
        let seen = seen.clone();
        assert!(
            wait_for(
                || seen.try_lock().map(|s| s.len() == 1).unwrap_or(false),
                Duration::from_secs(5)
            )
            .await
        );
    }
    sub.abort();

    // Restart: `b` must be redelivered (after its in-flight deadline), then `c`.
    let recorder = Arc::new(Recorder::default());
    let sub = bus.subscribe("g", "t", recorder.clone()).unwrap();
    let rec = recorder.clone();
    assert!(
        wait_for(
            || rec.seen.try_lock().map(|s| s.len() == 2).unwrap_or(false),
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(*recorder.seen.lock().await, vec!["b", "c"]);
    sub.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_go_to_dlq_exactly_once_and_group_advances() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(DurableBus::open(dir.path(), test_config()).unwrap());

    bus.publish(envelope("t", "poison", "bad")).await.unwrap();
    bus.publish(envelope("t", "fine", "good")).await.unwrap();

    struct PoisonAware {
        seen: Mutex<Vec<String>>,
    }
    #[async_trait]
    impl EventHandler for PoisonAware {
        async fn handle(&self, env: Envelope, _deadline: Duration) -> HandlerOutcome {
            if env.idempotency_key == "poison" {
                return HandlerOutcome::retry("still poisoned");
            }
            self.seen.lock().await.push(env.idempotency_key.clone());
            HandlerOutcome::Ack
        }
    }
    let handler = Arc::new(PoisonAware {
        seen: Mutex::new(Vec::new()),
    });
    let sub = bus.subscribe("g", "t", handler.clone()).unwrap();

    let h = handler.clone();
    assert!(
        wait_for(
            || h.seen.try_lock().map(|s| s.len() == 1).unwrap_or(false),
            Duration::from_secs(10)
        )
        .await
    );

    let dlq = bus.read_dlq("t", 0, 16).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].1.envelope.idempotency_key, "poison");
    // max_retries = 2 means 3 total attempts.
    assert_eq!(dlq[0].1.attempts, 3);
    assert_eq!(bus.committed("g", "t").unwrap(), Some(1));
    sub.shutdown().await;
}

#[tokio::test]
async fn non_retryable_nack_dead_letters_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(DurableBus::open(dir.path(), test_config()).unwrap());

    bus.publish(envelope("t", "bad", "x")).await.unwrap();
    let sub = bus
        .subscribe("g", "t", Arc::new(AlwaysNack { retryable: false }))
        .unwrap();

    let bus2 = bus.clone();
    assert!(
        wait_for(
            || bus2.committed("g", "t").ok().flatten() == Some(0),
            Duration::from_secs(5)
        )
        .await
    );
    let dlq = bus.read_dlq("t", 0, 16).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].1.attempts, 1);
    sub.shutdown().await;
}

#[tokio::test]
async fn replay_rereads_from_requested_offset() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(DurableBus::open(dir.path(), test_config()).unwrap());

    for key in ["a", "b", "c"] {
        bus.publish(envelope("t", key, key)).await.unwrap();
    }
    let recorder = Arc::new(Recorder::default());
    let sub = bus.subscribe("g", "t", recorder.clone()).unwrap();
    let rec = recorder.clone();
    assert!(
        wait_for(
            || rec.seen.try_lock().map(|s| s.len() == 3).unwrap_or(false),
            Duration::from_secs(5)
        )
        .await
    );

    bus.replay("g", "t", 1).unwrap();
    let rec = recorder.clone();
    assert!(
        wait_for(
            || rec.seen.try_lock().map(|s| s.len() == 5).unwrap_or(false),
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(
        *recorder.seen.lock().await,
        vec!["a", "b", "c", "b", "c"]
    );
    sub.shutdown().await;
}

#[tokio::test]
async fn back_pressure_rejects_when_a_group_lags() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.lag_high_watermark = 2;
    let bus = Arc::new(DurableBus::open(dir.path(), config).unwrap());

    // A group that exists durably but consumes nothing.
    let _ = bus.publish(envelope("t", "k0", "x")).await.unwrap();
    let sub = bus
        .subscribe("lagging", "t", Arc::new(AlwaysNack { retryable: true }))
        .unwrap();
    sub.abort();

    let mut hit_back_pressure = false;
    for i in 1..10 {
        match bus.publish(envelope("t", &format!("k{i}"), "x")).await {
            Ok(_) => {}
            Err(famos_bus::PublishError::BackPressure { .. }) => {
                hit_back_pressure = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(hit_back_pressure, "lagging group never tripped back-pressure");
}

#[tokio::test]
async fn qos_max_retries_overrides_bus_default() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(DurableBus::open(dir.path(), test_config()).unwrap());

    let mut env = envelope("t", "one-shot", "x");
    env.qos = QoS {
        timeout_ms: Some(300),
        max_retries: Some(0),
        priority: None,
    };
    bus.publish(env).await.unwrap();
    let sub = bus
        .subscribe("g", "t", Arc::new(AlwaysNack { retryable: true }))
        .unwrap();

    let bus2 = bus.clone();
    assert!(
        wait_for(
            || bus2.committed("g", "t").ok().flatten() == Some(0),
            Duration::from_secs(5)
        )
        .await
    );
    let dlq = bus.read_dlq("t", 0, 16).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].1.attempts, 1);
    sub.shutdown().await;
}

#[tokio::test]
async fn tap_receives_live_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(DurableBus::open(dir.path(), test_config()).unwrap());

    let mut tap = bus.tap("t").unwrap();
    bus.publish(envelope("t", "live", "x")).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(1), tap.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.idempotency_key, "live");
}
