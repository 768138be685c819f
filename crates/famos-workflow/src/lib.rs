#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **famos-workflow** – Deterministic step execution over the event bus.
//!
//! A workflow is an ordered list of steps: `immediate` steps run a
//! registered handler synchronously, `wait_event` steps suspend the run
//! until a matching envelope arrives (or the wait times out). Run state is
//! persisted after every transition with write-temp-then-rename, so a crash
//! resumes exactly one step boundary back.
//!
//! Runs are keyed by `(spec_id, idempotency_key)`: redelivering the same
//! trigger resolves to the existing run, and every envelope a step emits is
//! sealed with an idempotency key derived from `(run, step)` so downstream
//! effects stay idempotent across replays.
//!
//! The prospective scheduler lives here too: triggers are future-dated
//! workflow starts with the same durability rules.

use serde::{Deserialize, Serialize};

mod coordinator;
pub mod prospective;
mod run;
mod spec;

pub use coordinator::{Coordinator, EmitDraft, StepContext, StepFailure, StepHandler};
pub use prospective::{
    eligibility, ProspectiveScheduler, Schedule, Trigger, TriggerStatus,
};
pub use run::{RunStore, StepResult, StepStatus, WaitState, WorkflowRun, RunState};
pub use spec::{EventMatch, StepSpec, WorkflowSpec};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Coordinator tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Default deadline for `wait_event` steps.
    pub default_wait_timeout_ms: u64,
    /// Default attempts for a failing immediate step before the run fails.
    pub step_max_attempts: u32,
    /// Base backoff between step retries.
    pub step_backoff_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout_ms: 600_000,
            step_max_attempts: 3,
            step_backoff_ms: 100,
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Coordinator failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Run file or idempotency pointer IO failed.
    #[error("workflow io error: {0}")]
    Io(#[from] std::io::Error),
    /// Run snapshot failed to encode or decode.
    #[error("run codec error: {0}")]
    Codec(String),
    /// Unknown spec id.
    #[error("unknown workflow spec: {0}")]
    UnknownSpec(String),
    /// Unknown handler reference in a spec.
    #[error("unknown step handler: {0}")]
    UnknownHandler(String),
    /// The policy gate refused an emitted envelope.
    #[error(transparent)]
    Policy(#[from] famos_policy::PolicyError),
    /// Bus publish failed.
    #[error("publish failed: {0}")]
    Publish(String),
    /// Bus administration failed.
    #[error("bus error: {0}")]
    Bus(String),
    /// The run exists but is in a state the operation does not apply to.
    #[error("run {run_id} is {state:?}")]
    InvalidState {
        /// Affected run.
        run_id: String,
        /// Its current state.
        state: RunState,
    },
}
