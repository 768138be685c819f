//! Workflow specifications.

use serde::{Deserialize, Serialize};

use famos_types::EventType;

/// Filter a `wait_event` step applies to the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMatch {
    /// Topic to watch.
    pub topic: String,
    /// Required envelope type.
    pub event_type: EventType,
    /// Name of a run variable whose string value must equal the envelope's
    /// `correlation_id`. `None` matches any correlation.
    pub correlation_var: Option<String>,
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSpec {
    /// Runs a registered handler synchronously; may emit envelopes.
    Immediate {
        /// Step id, unique within the spec.
        id: String,
        /// Handler registry reference.
        handler: String,
    },
    /// Suspends the run until a matching envelope arrives.
    WaitEvent {
        /// Step id, unique within the spec.
        id: String,
        /// Match filter.
        #[serde(rename = "match")]
        matcher: EventMatch,
        /// Step-specific deadline; the coordinator default applies when absent.
        timeout_ms: Option<u64>,
        /// Variable receiving the matched envelope's payload.
        output_var: String,
    },
}

impl StepSpec {
    /// The step id.
    pub fn id(&self) -> &str {
        match self {
            StepSpec::Immediate { id, .. } => id,
            StepSpec::WaitEvent { id, .. } => id,
        }
    }
}

/// Ordered step list with a stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Spec id referenced by triggers and idempotency pointers.
    pub id: String,
    /// Steps, executed strictly in order.
    pub steps: Vec<StepSpec>,
}

impl WorkflowSpec {
    /// A spec with the given id and steps.
    pub fn new(id: impl Into<String>, steps: Vec<StepSpec>) -> Self {
        Self {
            id: id.into(),
            steps,
        }
    }
}
