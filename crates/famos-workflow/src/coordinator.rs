//! The coordinator: trigger dedup, step execution, suspend/resume.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use famos_bus::{DurableBus, EventHandler, HandlerOutcome};
use famos_policy::{gate, PolicyEngine, RequestContext};
use famos_types::{Band, Envelope, EventType};

use crate::run::{RunState, RunStore, StepResult, StepStatus, WaitState, WorkflowRun};
use crate::spec::{StepSpec, WorkflowSpec};
use crate::{WorkflowConfig, WorkflowError};

//─────────────────────────────
//  Step handler contract
//─────────────────────────────

/// An envelope a step wants to emit. The coordinator seals it with the
/// run's identity and a deterministic idempotency key, gates it, and
/// publishes it.
#[derive(Debug, Clone)]
pub struct EmitDraft {
    /// Destination topic.
    pub topic: String,
    /// Catalog type.
    pub event_type: EventType,
    /// Sensitivity band.
    pub band: Band,
    /// Payload value.
    pub payload: serde_json::Value,
    /// Optional correlation id for request/response pairing.
    pub correlation_id: Option<String>,
}

/// Mutable view a step handler works against.
pub struct StepContext<'a> {
    /// Run variables; earlier steps' outputs are visible here.
    pub variables: &'a mut serde_json::Map<String, serde_json::Value>,
    /// The trigger envelope that started the run.
    pub trigger: &'a Envelope,
    /// Envelopes to emit after the step succeeds.
    pub outbox: Vec<EmitDraft>,
}

/// Why a step did not complete.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepFailure {
    /// Transient; the coordinator retries with backoff.
    #[error("retryable step failure: {0}")]
    Retryable(String),
    /// Permanent; the run fails.
    #[error("fatal step failure: {0}")]
    Fatal(String),
}

/// Handler behind an `immediate` step. Handlers MUST be deterministic in the
/// run variables: crash replay may execute a step twice and relies on
/// emitted envelopes deduping by their derived idempotency keys.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute the step.
    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<(), StepFailure>;
}

//─────────────────────────────
//  Coordinator
//─────────────────────────────

/// Process-scoped workflow coordinator.
pub struct Coordinator {
    config: WorkflowConfig,
    store: RunStore,
    specs: DashMap<String, Arc<WorkflowSpec>>,
    handlers: DashMap<String, Arc<dyn StepHandler>>,
    bus: Arc<DurableBus>,
    policy: Arc<dyn PolicyEngine>,
}

impl Coordinator {
    /// Build a coordinator over a run store, bus, and policy gate.
    pub fn new(
        config: WorkflowConfig,
        store: RunStore,
        bus: Arc<DurableBus>,
        policy: Arc<dyn PolicyEngine>,
    ) -> Self {
        Self {
            config,
            store,
            specs: DashMap::new(),
            handlers: DashMap::new(),
            bus,
            policy,
        }
    }

    /// Register a workflow spec.
    pub fn register_spec(&self, spec: WorkflowSpec) {
        self.specs.insert(spec.id.clone(), Arc::new(spec));
    }

    /// Register a step handler under a name specs refer to.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Access the run store (inspection, retention sweeps).
    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Start (or resolve) a run for a trigger envelope.
    ///
    /// Runs are keyed by `(spec_id, trigger.idempotency_key)`: a duplicate
    /// trigger returns the existing run id without executing anything.
    pub async fn trigger(
        &self,
        spec_id: &str,
        trigger: Envelope,
        ctx: &RequestContext,
    ) -> Result<Uuid, WorkflowError> {
        if !self.specs.contains_key(spec_id) {
            return Err(WorkflowError::UnknownSpec(spec_id.to_string()));
        }
        let mut run = WorkflowRun::new(spec_id, trigger);
        if let Some(existing) =
            self.store
                .claim_idempotency(spec_id, &run.idempotency_key, &run.run_id)?
        {
            debug!(spec_id, key = %run.idempotency_key, run = %existing, "duplicate trigger");
            return Ok(existing);
        }
        self.store.save(&run)?;
        info!(spec_id, run = %run.run_id, "run created");
        self.drive(&mut run, ctx).await?;
        Ok(run.run_id)
    }

    /// Resume every non-terminal run after a restart. Returns how many runs
    /// were driven.
    pub async fn resume_open_runs(&self, ctx: &RequestContext) -> Result<usize, WorkflowError> {
        let open = self.store.open_runs()?;
        let count = open.len();
        for mut run in open {
            info!(run = %run.run_id, state = ?run.state, "resuming run");
            self.drive(&mut run, ctx).await?;
        }
        Ok(count)
    }

    /// Cancel a non-terminal run.
    pub fn cancel(&self, run_id: &Uuid) -> Result<(), WorkflowError> {
        let mut run = self
            .store
            .load(run_id)?
            .ok_or_else(|| WorkflowError::UnknownSpec(run_id.to_string()))?;
        if run.state.is_terminal() {
            return Err(WorkflowError::InvalidState {
                run_id: run_id.to_string(),
                state: run.state,
            });
        }
        run.state = RunState::Cancelled;
        self.store.save(&run)?;
        Ok(())
    }

    async fn drive(&self, run: &mut WorkflowRun, ctx: &RequestContext) -> Result<(), WorkflowError> {
        let spec = self
            .specs
            .get(&run.spec_id)
            .ok_or_else(|| WorkflowError::UnknownSpec(run.spec_id.clone()))?
            .clone();

        while run.current_step < spec.steps.len() {
            if run.state.is_terminal() {
                return Ok(());
            }
            match &spec.steps[run.current_step] {
                StepSpec::Immediate { id, handler } => {
                    self.run_immediate(run, id, handler, ctx).await?;
                }
                StepSpec::WaitEvent {
                    id,
                    matcher,
                    timeout_ms,
                    output_var,
                } => {
                    // Reuse a persisted wait (crash resume keeps the original
                    // deadline); otherwise arm a fresh one.
                    if run.waits.is_none() {
                        let correlation_id = matcher.correlation_var.as_ref().and_then(|var| {
                            run.variables
                                .get(var)
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string())
                                .or_else(|| run.trigger.correlation_id.clone())
                        });
                        let timeout =
                            timeout_ms.unwrap_or(self.config.default_wait_timeout_ms);
                        run.waits = Some(WaitState {
                            topic: matcher.topic.clone(),
                            event_type: matcher.event_type,
                            correlation_id,
                            deadline: Utc::now()
                                + chrono::Duration::milliseconds(timeout as i64),
                            output_var: output_var.clone(),
                        });
                    }
                    run.state = RunState::Waiting;
                    self.store.save(run)?;

                    let wait = run.waits.clone().expect("armed above");
                    let step_id = id.clone();
                    match self.wait_for_event(run, &wait).await? {
                        Some(envelope) => {
                            run.variables
                                .insert(wait.output_var.clone(), envelope.payload.clone());
                            run.waits = None;
                            run.state = RunState::Running;
                            run.history.push(StepResult {
                                step_id,
                                status: StepStatus::Ok,
                                finished_at: Utc::now(),
                            });
                            run.current_step += 1;
                            self.store.save(run)?;
                        }
                        None => {
                            run.history.push(StepResult {
                                step_id,
                                status: StepStatus::TimedOut,
                                finished_at: Utc::now(),
                            });
                            run.waits = None;
                            run.state = RunState::Failed;
                            self.store.save(run)?;
                            return Ok(());
                        }
                    }
                }
            }
        }

        if !run.state.is_terminal() {
            run.state = RunState::Completed;
            self.store.save(run)?;
            info!(run = %run.run_id, "run completed");
        }
        Ok(())
    }

    async fn run_immediate(
        &self,
        run: &mut WorkflowRun,
        step_id: &str,
        handler_name: &str,
        ctx: &RequestContext,
    ) -> Result<(), WorkflowError> {
        let handler = self
            .handlers
            .get(handler_name)
            .ok_or_else(|| WorkflowError::UnknownHandler(handler_name.to_string()))?
            .clone();
        run.state = RunState::Running;
        self.store.save(run)?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut step_ctx = StepContext {
                variables: &mut run.variables,
                trigger: &run.trigger,
                outbox: Vec::new(),
            };
            match handler.run(&mut step_ctx).await {
                Ok(()) => {
                    let outbox = step_ctx.outbox;
                    for (seq, draft) in outbox.into_iter().enumerate() {
                        if let Err(failure) = self.emit(run, step_id, seq, draft, ctx).await {
                            let kind = match &failure {
                                WorkflowError::Policy(_) => "PolicyDenied",
                                WorkflowError::Publish(_) => "Io",
                                _ => "Invalid",
                            };
                            return self.fail_step(run, step_id, kind, &failure);
                        }
                    }
                    run.history.push(StepResult {
                        step_id: step_id.to_string(),
                        status: StepStatus::Ok,
                        finished_at: Utc::now(),
                    });
                    run.current_step += 1;
                    self.store.save(run)?;
                    return Ok(());
                }
                Err(StepFailure::Retryable(reason)) if attempt < self.config.step_max_attempts => {
                    warn!(
                        run = %run.run_id,
                        step_id,
                        attempt,
                        %reason,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(
                        self.config.step_backoff_ms * attempt as u64,
                    ))
                    .await;
                }
                Err(StepFailure::Retryable(reason)) => {
                    return self.fail_step(run, step_id, "RetriesExhausted", &reason);
                }
                Err(StepFailure::Fatal(reason)) => {
                    return self.fail_step(run, step_id, "Fatal", &reason);
                }
            }
        }
    }

    fn fail_step(
        &self,
        run: &mut WorkflowRun,
        step_id: &str,
        error_kind: &str,
        reason: &impl std::fmt::Display,
    ) -> Result<(), WorkflowError> {
        warn!(run = %run.run_id, step_id, error_kind, %reason, "run failed");
        run.history.push(StepResult {
            step_id: step_id.to_string(),
            status: StepStatus::Failed {
                error_kind: error_kind.to_string(),
                reason: reason.to_string(),
            },
            finished_at: Utc::now(),
        });
        run.state = RunState::Failed;
        self.store.save(run)?;
        Ok(())
    }

    /// Seal, gate, and publish one step emission.
    ///
    /// The idempotency key is `trigger_key/step_id#seq` and the timestamp is
    /// the trigger's, so a replayed step emits byte-identical envelopes and
    /// downstream dedup holds.
    async fn emit(
        &self,
        run: &WorkflowRun,
        step_id: &str,
        seq: usize,
        draft: EmitDraft,
        ctx: &RequestContext,
    ) -> Result<(), WorkflowError> {
        let key = Envelope::derived_idempotency_key(
            &run.idempotency_key,
            &format!("{step_id}#{seq}"),
        );
        let mut builder = Envelope::builder(
            draft.topic,
            draft.event_type,
            run.trigger.space_id.clone(),
            run.trigger.actor.clone(),
            run.trigger.device.clone(),
        )
        .band(draft.band)
        .idempotency_key(key)
        .payload(&draft.payload)
        .map_err(|e| WorkflowError::Codec(e.to_string()))?;
        if let Some(correlation) = draft.correlation_id {
            builder = builder.correlation_id(correlation);
        } else if let Some(correlation) = &run.trigger.correlation_id {
            builder = builder.correlation_id(correlation.clone());
        }
        if let Some(trace) = &run.trigger.trace_id {
            builder = builder.trace_id(trace.clone());
        }
        let envelope = builder
            .seal(run.trigger.ts)
            .map_err(|e| WorkflowError::Codec(e.to_string()))?;

        let envelope = gate(self.policy.as_ref(), envelope, ctx)?;
        self.bus
            .publish(envelope)
            .await
            .map_err(|e| WorkflowError::Publish(e.to_string()))?;
        Ok(())
    }

    /// Park on a durable single-shot subscription until the filter matches
    /// or the persisted deadline passes.
    async fn wait_for_event(
        &self,
        run: &WorkflowRun,
        wait: &WaitState,
    ) -> Result<Option<Envelope>, WorkflowError> {
        let group = format!("workflows:{}:{}", run.spec_id, run.run_id.simple());
        let (tx, rx) = oneshot::channel();
        let handler = Arc::new(WaitHandler {
            event_type: wait.event_type,
            correlation_id: wait.correlation_id.clone(),
            tx: Mutex::new(Some(tx)),
        });
        let sub = self
            .bus
            .subscribe(&group, &wait.topic, handler)
            .map_err(|e| WorkflowError::Bus(e.to_string()))?;

        let remaining = (wait.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let outcome = tokio::time::timeout(remaining, rx).await;
        sub.shutdown().await;
        match outcome {
            Ok(Ok(envelope)) => Ok(Some(envelope)),
            // Sender dropped without a match or the deadline passed.
            _ => Ok(None),
        }
    }
}

/// Single-shot filter subscribed while a run waits.
struct WaitHandler {
    event_type: EventType,
    correlation_id: Option<String>,
    tx: Mutex<Option<oneshot::Sender<Envelope>>>,
}

#[async_trait]
impl EventHandler for WaitHandler {
    async fn handle(&self, envelope: Envelope, _deadline: Duration) -> HandlerOutcome {
        let type_matches = envelope.event_type == self.event_type;
        let correlation_matches = match &self.correlation_id {
            Some(expected) => envelope.correlation_id.as_deref() == Some(expected.as_str()),
            None => true,
        };
        if type_matches && correlation_matches {
            if let Some(tx) = self.tx.lock().await.take() {
                let _ = tx.send(envelope);
            }
        }
        // Non-matching traffic is simply not for this run.
        HandlerOutcome::Ack
    }
}
