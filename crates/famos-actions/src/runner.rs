//! The execution state machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use famos_bus::DurableBus;
use famos_policy::{Decision, DeviceTrust, PolicyEngine, RequestContext};
use famos_types::payload::ActionExecuted;
use famos_types::{Band, Envelope, EventType, SpaceId};

use crate::receipts::{Receipt, ReceiptStatus, ReceiptStore};
use crate::sandbox::SandboxContext;
use crate::spec::{idempotency_key, SafetyClass, ToolRegistry};
use crate::{ActionConfig, ActionError};

/// Reward weights `(w_s, w_q, w_c, w_ℓ)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RewardWeights {
    /// Success weight.
    pub success: f64,
    /// Quality weight.
    pub quality: f64,
    /// Cost penalty.
    pub cost: f64,
    /// Latency penalty.
    pub latency: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            success: 0.6,
            quality: 0.3,
            cost: 0.05,
            latency: 0.05,
        }
    }
}

/// One execution request.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    /// Tool to run.
    pub tool_id: String,
    /// Tool parameters.
    pub params: serde_json::Value,
    /// Acting family member.
    pub actor: String,
    /// Requesting device.
    pub device: String,
    /// Space the effect belongs to.
    pub space_id: SpaceId,
    /// Sensitivity band of the request.
    pub band: Band,
    /// Trace id propagated into the receipt.
    pub trace_id: Option<String>,
    /// Filesystem roots the sandbox allows for this call.
    pub allowed_paths: Vec<PathBuf>,
}

/// Policy-gated, sandboxed, receipt-producing tool executor.
pub struct ActionRunner {
    config: ActionConfig,
    registry: Arc<ToolRegistry>,
    receipts: Arc<ReceiptStore>,
    policy: Arc<dyn PolicyEngine>,
    bus: Arc<DurableBus>,
    reward: RewardWeights,
}

impl ActionRunner {
    /// Build a runner.
    pub fn new(
        config: ActionConfig,
        registry: Arc<ToolRegistry>,
        receipts: Arc<ReceiptStore>,
        policy: Arc<dyn PolicyEngine>,
        bus: Arc<DurableBus>,
    ) -> Self {
        Self {
            config,
            registry,
            receipts,
            policy,
            bus,
            reward: RewardWeights::default(),
        }
    }

    /// The receipt store (queries by trace id).
    pub fn receipts(&self) -> &ReceiptStore {
        &self.receipts
    }

    /// Run the full state machine for one request. Every terminal outcome
    /// produces a receipt; only `Ok` receipts have side effects.
    pub async fn execute(
        &self,
        request: ActionRequest,
        ctx: &RequestContext,
    ) -> Result<Receipt, ActionError> {
        let started_at = Utc::now();
        let started = std::time::Instant::now();

        // Validate.
        let Some((spec, adapter)) = self.registry.get(&request.tool_id).await else {
            return Err(ActionError::UnknownTool(request.tool_id.clone()));
        };
        for field in &spec.params_required {
            if request.params.get(field).is_none() {
                let err = ActionError::InvalidParams(format!("missing param: {field}"));
                let receipt = self
                    .finish(&request, &spec.tool_id, ReceiptStatus::Error, None, &err, started_at, started)
                    .await?;
                return Ok(receipt);
            }
        }
        let key = idempotency_key(&spec, &request.params);

        // GatePolicy: evaluated at dispatch time, not decision time.
        let decision_envelope = self.decision_envelope(&request, &key)?;
        match self.policy.evaluate(&decision_envelope, ctx) {
            Decision::Deny { reason } => {
                let err = ActionError::PolicyDenied(reason);
                let receipt = self
                    .finish(&request, &spec.tool_id, ReceiptStatus::Error, None, &err, started_at, started)
                    .await?;
                return Ok(receipt);
            }
            Decision::Allow | Decision::AllowWithObligations(_) => {}
        }

        // Safety class.
        let blocked = match spec.safety_class {
            SafetyClass::Critical => Some("critical tools require human review"),
            SafetyClass::High if ctx.device_trust != DeviceTrust::High => {
                Some("high-safety tools require an attested device")
            }
            _ => None,
        };
        if let Some(reason) = blocked {
            let err = ActionError::SafetyBlocked(reason.to_string());
            let receipt = self
                .finish(
                    &request,
                    &spec.tool_id,
                    ReceiptStatus::Quarantined,
                    None,
                    &err,
                    started_at,
                    started,
                )
                .await?;
            return Ok(receipt);
        }

        // IdempotencyCheck: a prior success short-circuits execution.
        if let Some(prior) = self.receipts.cached(&key) {
            info!(tool = %spec.tool_id, key = %key, "returning cached receipt");
            let receipt = Receipt {
                receipt_id: Uuid::new_v4(),
                status: ReceiptStatus::Skipped,
                started_at,
                duration_ms: started.elapsed().as_millis() as u64,
                reason: Some("cached".into()),
                reward: None,
                trace_id: request.trace_id.clone(),
                ..prior
            };
            self.receipts.append(&receipt)?;
            return Ok(receipt);
        }

        // SandboxEnter → DispatchAdapter.
        let timeout_ms = spec.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let budget = Duration::from_millis(timeout_ms);
        let sandbox = SandboxContext::enter(
            spec.sandbox_profile,
            request.allowed_paths.clone(),
            budget,
        );
        let dispatched = tokio::time::timeout(budget, adapter.dispatch(&request.params, &sandbox)).await;

        // Capture → PersistReceipt → PublishEvent / HandleError.
        match dispatched {
            Ok(Ok(outputs)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let cost = (duration_ms as f64 / timeout_ms as f64).clamp(0.0, 1.0);
                let latency_norm = cost;
                let reward = self.reward.success + self.reward.quality
                    - self.reward.cost * cost
                    - self.reward.latency * latency_norm;
                let receipt = Receipt {
                    receipt_id: Uuid::new_v4(),
                    tool_id: spec.tool_id.clone(),
                    status: ReceiptStatus::Ok,
                    started_at,
                    duration_ms,
                    cost,
                    inputs_hash: hash_value(&request.params),
                    outputs: Some(outputs),
                    policy_version: self.policy.version(),
                    idempotency_key: key,
                    trace_id: request.trace_id.clone(),
                    reason: None,
                    reward: Some(reward),
                };
                self.receipts.append(&receipt)?;
                self.publish_executed(&request, &receipt).await?;
                Ok(receipt)
            }
            Ok(Err(err)) => {
                let status = match &err {
                    ActionError::SafetyBlocked(_) => ReceiptStatus::Quarantined,
                    _ => ReceiptStatus::Error,
                };
                let receipt = self
                    .finish(&request, &spec.tool_id, status, None, &err, started_at, started)
                    .await?;
                Ok(receipt)
            }
            Err(_) => {
                let err = ActionError::Timeout(timeout_ms);
                let receipt = self
                    .finish(&request, &spec.tool_id, ReceiptStatus::Error, None, &err, started_at, started)
                    .await?;
                Ok(receipt)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        request: &ActionRequest,
        tool_id: &str,
        status: ReceiptStatus,
        outputs: Option<serde_json::Value>,
        err: &ActionError,
        started_at: chrono::DateTime<Utc>,
        started: std::time::Instant,
    ) -> Result<Receipt, ActionError> {
        warn!(tool = %tool_id, error = %err, ?status, "action did not execute cleanly");
        let receipt = Receipt {
            receipt_id: Uuid::new_v4(),
            tool_id: tool_id.to_string(),
            status,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            cost: 0.0,
            inputs_hash: hash_value(&request.params),
            outputs,
            policy_version: self.policy.version(),
            idempotency_key: idempotency_key_for(request, tool_id),
            trace_id: request.trace_id.clone(),
            reason: Some(err.to_string()),
            reward: None,
        };
        self.receipts.append(&receipt)?;
        self.publish_executed(request, &receipt).await?;
        Ok(receipt)
    }

    fn decision_envelope(
        &self,
        request: &ActionRequest,
        key: &str,
    ) -> Result<Envelope, ActionError> {
        let mut builder = Envelope::builder(
            self.config.executed_topic.clone(),
            EventType::ActionDecision,
            request.space_id.clone(),
            request.actor.clone(),
            request.device.clone(),
        )
        .band(request.band)
        .idempotency_key(format!("decision/{key}"))
        .payload(&serde_json::json!({
            "tool_id": request.tool_id,
            "inputs_hash": hash_value(&request.params),
        }))
        .map_err(|e| ActionError::InvalidParams(e.to_string()))?;
        if let Some(trace) = &request.trace_id {
            builder = builder.trace_id(trace.clone());
        }
        builder
            .seal(Utc::now())
            .map_err(|e| ActionError::InvalidParams(e.to_string()))
    }

    async fn publish_executed(
        &self,
        request: &ActionRequest,
        receipt: &Receipt,
    ) -> Result<(), ActionError> {
        let payload = ActionExecuted {
            tool_id: receipt.tool_id.clone(),
            status: format!("{:?}", receipt.status).to_lowercase(),
            idempotency_key: receipt.idempotency_key.clone(),
            duration_ms: receipt.duration_ms,
        };
        let mut builder = Envelope::builder(
            self.config.executed_topic.clone(),
            EventType::ActionExecuted,
            request.space_id.clone(),
            request.actor.clone(),
            request.device.clone(),
        )
        .band(request.band)
        .idempotency_key(format!("executed/{}", receipt.receipt_id.simple()))
        .payload(&payload)
        .map_err(|e| ActionError::Publish(e.to_string()))?;
        if let Some(trace) = &request.trace_id {
            builder = builder.trace_id(trace.clone());
        }
        let envelope = builder
            .seal(Utc::now())
            .map_err(|e| ActionError::Publish(e.to_string()))?;
        self.bus
            .publish(envelope)
            .await
            .map_err(|e| ActionError::Publish(e.to_string()))?;
        Ok(())
    }
}

fn hash_value(value: &serde_json::Value) -> String {
    blake3::hash(value.to_string().as_bytes()).to_hex()[..32].to_string()
}

fn idempotency_key_for(request: &ActionRequest, tool_id: &str) -> String {
    format!("{}/{}", tool_id, hash_value(&request.params))
}
