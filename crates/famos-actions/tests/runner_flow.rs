//! Action runner state-machine behaviour.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use famos_actions::{
    ActionConfig, ActionError, ActionRequest, ActionRunner, ReceiptStatus, ReceiptStore,
    SafetyClass, SandboxContext, SandboxProfile, ToolAdapter, ToolRegistry, ToolSpec,
};
use famos_bus::{BusConfig, DurableBus};
use famos_policy::{FamilyPolicy, PolicySnapshot, RequestContext, Role};
use famos_types::{Band, SpaceId, SpaceKind};

//──────────────────────────────────────────────────────────────────────────────
//  Fixtures
//──────────────────────────────────────────────────────────────────────────────

struct CountingAdapter {
    calls: AtomicU32,
    delay: Duration,
}

#[async_trait]
impl ToolAdapter for CountingAdapter {
    async fn dispatch(
        &self,
        params: &serde_json::Value,
        sandbox: &SandboxContext,
    ) -> Result<serde_json::Value, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(path) = params.get("path").and_then(|p| p.as_str()) {
            sandbox.check_path(std::path::Path::new(path))?;
        }
        tokio::time::sleep(self.delay).await;
        Ok(serde_json::json!({ "wrote": true }))
    }
}

fn tool_spec(tool_id: &str, safety: SafetyClass, timeout_ms: u64) -> ToolSpec {
    ToolSpec {
        tool_id: tool_id.into(),
        version: "1.0.0".into(),
        caps_required: vec!["notes.write".into()],
        params_required: vec!["path".into(), "text".into()],
        side_effects: true,
        safety_class: safety,
        timeout_ms: Some(timeout_ms),
        idempotency_key_fields: vec!["path".into(), "text".into()],
        sandbox_profile: SandboxProfile::Default,
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    bus: Arc<DurableBus>,
    runner: ActionRunner,
    adapter: Arc<CountingAdapter>,
}

async fn fixture(safety: SafetyClass, timeout_ms: u64, delay: Duration) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(DurableBus::open(dir.path().join("bus"), BusConfig::default()).unwrap());
    let registry = Arc::new(ToolRegistry::new());
    let adapter = Arc::new(CountingAdapter {
        calls: AtomicU32::new(0),
        delay,
    });
    registry
        .register(tool_spec("file_note", safety, timeout_ms), adapter.clone())
        .await
        .unwrap();
    let receipts =
        Arc::new(ReceiptStore::open(dir.path().join("receipts").join("receipts.log")).unwrap());
    let mut snapshot = PolicySnapshot::default();
    snapshot.roles.insert("mom".into(), Role::Admin);
    let policy = Arc::new(FamilyPolicy::new(snapshot));
    let runner = ActionRunner::new(
        ActionConfig::default(),
        registry,
        receipts,
        policy,
        bus.clone(),
    );
    Fixture {
        _dir: dir,
        bus,
        runner,
        adapter,
    }
}

fn request(band: Band) -> ActionRequest {
    ActionRequest {
        tool_id: "file_note".into(),
        params: serde_json::json!({ "path": "/workspace/notes/today.md", "text": "hi" }),
        actor: "alice".into(),
        device: "alice-phone".into(),
        space_id: SpaceId::new(SpaceKind::Shared, "household").unwrap(),
        band,
        trace_id: Some("tr-1".into()),
        allowed_paths: vec![PathBuf::from("/workspace/notes")],
    }
}

fn ctx() -> RequestContext {
    RequestContext::trusted(Utc::now())
}

//──────────────────────────────────────────────────────────────────────────────
//  Tests
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn successful_execution_produces_receipt_and_event() {
    let fx = fixture(SafetyClass::Medium, 1_000, Duration::ZERO).await;
    let mut tap = fx.bus.tap("actions").unwrap();

    let receipt = fx.runner.execute(request(Band::Green), &ctx()).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Ok);
    assert!(receipt.reward.unwrap() > 0.8);
    assert_eq!(receipt.outputs, Some(serde_json::json!({ "wrote": true })));

    let event = tokio::time::timeout(Duration::from_secs(1), tap.recv())
        .await
        .unwrap()
        .unwrap();
    let payload: famos_types::payload::ActionExecuted = event.payload_as().unwrap();
    assert_eq!(payload.tool_id, "file_note");
    assert_eq!(payload.status, "ok");
}

#[tokio::test]
async fn cached_receipt_short_circuits_the_second_call() {
    let fx = fixture(SafetyClass::Medium, 1_000, Duration::ZERO).await;
    let first = fx.runner.execute(request(Band::Green), &ctx()).await.unwrap();
    assert_eq!(first.status, ReceiptStatus::Ok);
    let second = fx.runner.execute(request(Band::Green), &ctx()).await.unwrap();
    assert_eq!(second.status, ReceiptStatus::Skipped);
    assert_eq!(second.outputs, first.outputs);
    assert_eq!(fx.adapter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn policy_denial_leaves_no_side_effect() {
    let fx = fixture(SafetyClass::Medium, 1_000, Duration::ZERO).await;
    // BLACK band from a non-admin actor is always denied.
    let receipt = fx.runner.execute(request(Band::Black), &ctx()).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Error);
    assert!(receipt.reason.unwrap().contains("policy denied"));
    assert_eq!(fx.adapter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn critical_tools_are_quarantined() {
    let fx = fixture(SafetyClass::Critical, 1_000, Duration::ZERO).await;
    let receipt = fx.runner.execute(request(Band::Green), &ctx()).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Quarantined);
    assert_eq!(fx.adapter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn timeouts_become_error_receipts() {
    let fx = fixture(SafetyClass::Medium, 50, Duration::from_secs(5)).await;
    let receipt = fx.runner.execute(request(Band::Green), &ctx()).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Error);
    assert!(receipt.reason.unwrap().contains("timed out"));
}

#[tokio::test]
async fn sandbox_rejects_paths_outside_the_allowlist() {
    let fx = fixture(SafetyClass::Medium, 1_000, Duration::ZERO).await;
    let mut req = request(Band::Green);
    req.params = serde_json::json!({ "path": "/etc/passwd", "text": "nope" });
    let receipt = fx.runner.execute(req, &ctx()).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Quarantined);
}

#[tokio::test]
async fn receipts_are_queryable_by_trace_id() {
    let fx = fixture(SafetyClass::Medium, 1_000, Duration::ZERO).await;
    fx.runner.execute(request(Band::Green), &ctx()).await.unwrap();
    fx.runner.execute(request(Band::Green), &ctx()).await.unwrap();
    let receipts = fx.runner.receipts().by_trace("tr-1");
    assert_eq!(receipts.len(), 2);
}

#[tokio::test]
async fn unknown_tool_is_an_error() {
    let fx = fixture(SafetyClass::Medium, 1_000, Duration::ZERO).await;
    let mut req = request(Band::Green);
    req.tool_id = "no_such_tool".into();
    assert!(matches!(
        fx.runner.execute(req, &ctx()).await,
        Err(ActionError::UnknownTool(_))
    ));
}
