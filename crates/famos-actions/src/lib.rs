#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **famos-actions** – Side-effecting tools under policy.
//!
//! Tools never bypass the policy gate: every execution runs the
//! `Validate → GatePolicy → IdempotencyCheck → SandboxEnter → Dispatch →
//! Capture → PersistReceipt → PublishEvent` machine, re-checking policy at
//! dispatch time so a decision made earlier cannot be replayed into a
//! different context. A prior successful receipt for the same idempotency
//! key short-circuits execution and returns the cached result.
//!
//! Every attempt, successful or not, appends an immutable [`Receipt`] to
//! the append-only receipts log; a summary is published as
//! `ACTION_EXECUTED`.

use serde::{Deserialize, Serialize};

mod receipts;
mod runner;
mod sandbox;
mod spec;

pub use receipts::{Receipt, ReceiptStatus, ReceiptStore};
pub use runner::{ActionRequest, ActionRunner, RewardWeights};
pub use sandbox::{SandboxContext, SandboxProfile};
pub use spec::{SafetyClass, ToolAdapter, ToolRegistry, ToolSpec};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Action runner tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Dispatch deadline when the tool spec does not set one.
    pub default_timeout_ms: u64,
    /// Topic `ACTION_EXECUTED` summaries are published on.
    pub executed_topic: String,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            executed_topic: "actions".to_string(),
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Action execution failures. Terminal failures still produce a receipt;
/// this error type carries the machine-readable class into it.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Unknown tool id.
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    /// Params failed the tool's schema.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// The gate refused the execution.
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    /// The safety class blocked the execution; quarantined.
    #[error("safety blocked: {0}")]
    SafetyBlocked(String),
    /// The adapter exceeded its deadline.
    #[error("tool timed out after {0} ms")]
    Timeout(u64),
    /// The adapter failed.
    #[error("adapter error: {0}")]
    Adapter(String),
    /// Receipt store IO failed.
    #[error("receipt store error: {0}")]
    Receipts(String),
    /// Publishing the summary failed.
    #[error("publish failed: {0}")]
    Publish(String),
}
