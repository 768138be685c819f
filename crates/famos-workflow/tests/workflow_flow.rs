//! Coordinator and prospective-scheduler behaviour end to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use famos_bus::{BusConfig, DurableBus};
use famos_policy::{FamilyPolicy, PolicySnapshot, RequestContext};
use famos_types::payload::GatingContext;
use famos_types::{Band, Envelope, EventType, SpaceId, SpaceKind};
use famos_workflow::prospective::{ActionTemplate, PROSPECTIVE_TOPIC};
use famos_workflow::{
    Coordinator, EmitDraft, EventMatch, ProspectiveScheduler, RunState, RunStore, Schedule,
    StepContext, StepFailure, StepHandler, StepSpec, Trigger, TriggerStatus, WorkflowConfig,
    WorkflowSpec,
};

//──────────────────────────────────────────────────────────────────────────────
//  Fixtures
//──────────────────────────────────────────────────────────────────────────────

struct Fixture {
    _dir: tempfile::TempDir,
    bus: Arc<DurableBus>,
    coordinator: Arc<Coordinator>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(
        DurableBus::open(dir.path().join("bus"), BusConfig::default()).unwrap(),
    );
    let store = RunStore::open(dir.path().join("workflows")).unwrap();
    let policy = Arc::new(FamilyPolicy::new(PolicySnapshot::default()));
    let coordinator = Arc::new(Coordinator::new(
        WorkflowConfig::default(),
        store,
        bus.clone(),
        policy,
    ));
    Fixture {
        _dir: dir,
        bus,
        coordinator,
    }
}

fn space() -> SpaceId {
    SpaceId::new(SpaceKind::Shared, "household").unwrap()
}

fn trigger_envelope(key: &str) -> Envelope {
    Envelope::builder(
        "workflow.trigger",
        EventType::RecallQuery,
        space(),
        "alice",
        "alice-phone",
    )
    .idempotency_key(key)
    .correlation_id(format!("corr-{key}"))
    .payload(&serde_json::json!({ "k": 5 }))
    .unwrap()
    .seal(Utc::now())
    .unwrap()
}

fn ctx() -> RequestContext {
    RequestContext::trusted(Utc::now())
}

/// Emits one envelope onto `out.topic` and writes a marker variable.
struct EmitStep;

#[async_trait]
impl StepHandler for EmitStep {
    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<(), StepFailure> {
        ctx.variables
            .insert("ran".into(), serde_json::Value::Bool(true));
        ctx.outbox.push(EmitDraft {
            topic: "derived".into(),
            event_type: EventType::RecallRequest,
            band: Band::Green,
            payload: serde_json::json!({ "from": "emit_step" }),
            correlation_id: None,
        });
        Ok(())
    }
}

/// Fails a configurable number of times before succeeding.
struct FlakyStep {
    failures: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl StepHandler for FlakyStep {
    async fn run(&self, _ctx: &mut StepContext<'_>) -> Result<(), StepFailure> {
        use std::sync::atomic::Ordering;
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        self.failures.store(remaining - 1, Ordering::SeqCst);
        Err(StepFailure::Retryable("not yet".into()))
    }
}

//──────────────────────────────────────────────────────────────────────────────
//  Tests
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_triggers_resolve_to_one_run() {
    let fx = fixture();
    fx.coordinator.register_spec(WorkflowSpec::new(
        "emit",
        vec![StepSpec::Immediate {
            id: "s1".into(),
            handler: "emit".into(),
        }],
    ));
    fx.coordinator.register_handler("emit", Arc::new(EmitStep));

    let env = trigger_envelope("t-1");
    let first = fx
        .coordinator
        .trigger("emit", env.clone(), &ctx())
        .await
        .unwrap();
    let second = fx.coordinator.trigger("emit", env, &ctx()).await.unwrap();
    assert_eq!(first, second);

    // The derived envelope landed exactly once.
    assert_eq!(fx.bus.topic_len("derived").await.unwrap(), 1);
    let run = fx.coordinator.store().load(&first).unwrap().unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.variables.get("ran"), Some(&serde_json::Value::Bool(true)));
}

#[tokio::test]
async fn emitted_envelopes_carry_deterministic_idempotency_keys() {
    let fx = fixture();
    fx.coordinator.register_spec(WorkflowSpec::new(
        "emit",
        vec![StepSpec::Immediate {
            id: "s1".into(),
            handler: "emit".into(),
        }],
    ));
    fx.coordinator.register_handler("emit", Arc::new(EmitStep));

    let mut tap = fx.bus.tap("derived").unwrap();
    fx.coordinator
        .trigger("emit", trigger_envelope("t-9"), &ctx())
        .await
        .unwrap();
    let emitted = tokio::time::timeout(Duration::from_secs(1), tap.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(emitted.idempotency_key, "t-9/s1#0");
    assert_eq!(emitted.correlation_id.as_deref(), Some("corr-t-9"));
}

#[tokio::test]
async fn wait_event_suspends_until_a_matching_envelope_arrives() {
    let fx = fixture();
    fx.coordinator.register_spec(WorkflowSpec::new(
        "waiting",
        vec![StepSpec::WaitEvent {
            id: "w1".into(),
            matcher: EventMatch {
                topic: "replies".into(),
                event_type: EventType::RecallResult,
                correlation_var: Some("missing_var".into()),
            },
            timeout_ms: Some(5_000),
            output_var: "reply".into(),
        }],
    ));

    let coordinator = fx.coordinator.clone();
    let run_task = tokio::spawn(async move {
        coordinator
            .trigger("waiting", trigger_envelope("t-wait"), &ctx())
            .await
    });

    // Give the run time to arm its subscription, then answer it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let reply = Envelope::builder(
        "replies",
        EventType::RecallResult,
        space(),
        "system",
        "hub",
    )
    .idempotency_key("reply-1")
    .correlation_id("corr-t-wait")
    .payload(&serde_json::json!({ "hits": [] }))
    .unwrap()
    .seal(Utc::now())
    .unwrap();
    fx.bus.publish(reply).await.unwrap();

    let run_id = run_task.await.unwrap().unwrap();
    let run = fx.coordinator.store().load(&run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert!(run.variables.contains_key("reply"));
}

#[tokio::test]
async fn wait_event_times_out_into_failed() {
    let fx = fixture();
    fx.coordinator.register_spec(WorkflowSpec::new(
        "waiting",
        vec![StepSpec::WaitEvent {
            id: "w1".into(),
            matcher: EventMatch {
                topic: "replies".into(),
                event_type: EventType::RecallResult,
                correlation_var: None,
            },
            timeout_ms: Some(200),
            output_var: "reply".into(),
        }],
    ));

    let run_id = fx
        .coordinator
        .trigger("waiting", trigger_envelope("t-timeout"), &ctx())
        .await
        .unwrap();
    let run = fx.coordinator.store().load(&run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert!(matches!(
        run.history.last().unwrap().status,
        famos_workflow::StepStatus::TimedOut
    ));
}

#[tokio::test]
async fn retryable_step_failures_eventually_succeed() {
    let fx = fixture();
    fx.coordinator.register_spec(WorkflowSpec::new(
        "flaky",
        vec![StepSpec::Immediate {
            id: "s1".into(),
            handler: "flaky".into(),
        }],
    ));
    fx.coordinator.register_handler(
        "flaky",
        Arc::new(FlakyStep {
            failures: std::sync::atomic::AtomicU32::new(2),
        }),
    );

    let run_id = fx
        .coordinator
        .trigger("flaky", trigger_envelope("t-flaky"), &ctx())
        .await
        .unwrap();
    let run = fx.coordinator.store().load(&run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Completed);
}

#[tokio::test]
async fn prospective_fire_then_skip_matches_the_gating_context() {
    let fx = fixture();
    let policy = Arc::new(FamilyPolicy::new(PolicySnapshot::default()));
    let dir = tempfile::tempdir().unwrap();
    let scheduler = ProspectiveScheduler::open(dir.path(), fx.bus.clone(), policy).unwrap();

    let created: chrono::DateTime<Utc> = "2025-09-01T00:00:00Z".parse().unwrap();
    let trigger = Trigger {
        id: "t1".into(),
        space_id: space(),
        actor: "alice".into(),
        device: "alice-phone".into(),
        schedule: Schedule::DailyTime {
            hour: 20,
            minute: 0,
            days_of_week: (0..7).collect(),
            tz: "UTC".into(),
        },
        action: ActionTemplate {
            topic: "actions".into(),
            event_type: EventType::ActionDecision,
            band: Band::Green,
            payload: serde_json::json!({ "do": "evening_checkin" }),
        },
        status: TriggerStatus::Draft,
        next_fire_at: None,
        fires: 0,
        snoozed_until: None,
        created_at: created,
    };
    let setup_now: chrono::DateTime<Utc> = "2025-09-06T10:00:00Z".parse().unwrap();
    scheduler.upsert(trigger, setup_now, &ctx()).await.unwrap();

    // Due slot with a calm context: fires, eligibility ≥ 0.85.
    let slot1: chrono::DateTime<Utc> = "2025-09-06T20:00:00Z".parse().unwrap();
    let calm = GatingContext {
        arousal: 0.2,
        safety_pressure: 0.1,
    };
    let mut tap = fx.bus.tap(PROSPECTIVE_TOPIC).unwrap();
    let fired = scheduler.poll(slot1, &calm, &ctx()).await.unwrap();
    assert_eq!(fired, 1);
    assert_eq!(fx.bus.topic_len("actions").await.unwrap(), 1);

    let mut saw_fired = false;
    while let Ok(env) = tap.try_recv() {
        if env.event_type == EventType::ProsTriggerFired {
            let payload: famos_types::payload::TriggerFired = env.payload_as().unwrap();
            assert!(payload.eligibility >= 0.85);
            assert_eq!(
                payload.next_fire_at,
                Some("2025-09-07T20:00:00Z".parse().unwrap())
            );
            saw_fired = true;
        }
    }
    assert!(saw_fired);

    // Next slot with high arousal: skipped with a reason and a further slot.
    let slot2: chrono::DateTime<Utc> = "2025-09-07T20:00:00Z".parse().unwrap();
    let agitated = GatingContext {
        arousal: 0.9,
        safety_pressure: 0.1,
    };
    let fired = scheduler.poll(slot2, &agitated, &ctx()).await.unwrap();
    assert_eq!(fired, 0);
    assert_eq!(fx.bus.topic_len("actions").await.unwrap(), 1);

    let mut saw_skipped = false;
    while let Ok(env) = tap.try_recv() {
        if env.event_type == EventType::ProsTriggerSkipped {
            let payload: famos_types::payload::TriggerSkipped = env.payload_as().unwrap();
            assert_eq!(payload.reason, "arousal_too_high");
            assert_eq!(
                payload.next_fire_at,
                Some("2025-09-08T20:00:00Z".parse().unwrap())
            );
            saw_skipped = true;
        }
    }
    assert!(saw_skipped);
}
