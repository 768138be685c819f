#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **famos-runtime** – Configuration and lifecycle for a FamilyOS device.
//!
//! The runtime owns every process-scoped service (bus, policy gate, memory
//! indexes, coordinator, consolidation engine, replicator, action runner),
//! wires the durable consumer groups of the write and recall pipelines, and
//! tears everything down cleanly. Services receive their collaborators as
//! explicit arguments; the only globals are the tracing subscriber.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

mod episodes;
mod handlers;
mod runtime;

pub use episodes::EpisodeStore;
pub use runtime::{Runtime, WriteIntent};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// The single immutable configuration struct, resolved at startup and
/// passed down by reference. Field defaults follow the recognized keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyConfig {
    /// Workspace root directory; every store lives underneath.
    pub workspace_root: PathBuf,
    /// IANA zone of this device, used for temporal bucketing.
    pub device_tz: String,
    /// This device's identifier (CRDT author id).
    pub device_id: String,
    /// Event bus knobs.
    #[serde(default)]
    pub bus: famos_bus::BusConfig,
    /// Workflow coordinator knobs.
    #[serde(default)]
    pub workflow: famos_workflow::WorkflowConfig,
    /// Temporal index knobs.
    #[serde(default)]
    pub temporal: famos_temporal::TemporalConfig,
    /// Working memory knobs.
    #[serde(default)]
    pub wm: famos_workspace::WmConfig,
    /// Hippocampus knobs.
    #[serde(default)]
    pub hippo: famos_hippocampus::HippoConfig,
    /// Consolidation knobs.
    #[serde(default)]
    pub consolidation: famos_consolidation::ConsolidationConfig,
    /// Sync replicator knobs.
    #[serde(default)]
    pub sync: famos_sync::SyncConfig,
    /// Action runner knobs.
    #[serde(default)]
    pub action: famos_actions::ActionConfig,
}

impl FamilyConfig {
    /// Defaults rooted at `workspace_root` for a device.
    pub fn for_device(
        workspace_root: impl Into<PathBuf>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            device_tz: "UTC".to_string(),
            device_id: device_id.into(),
            bus: Default::default(),
            workflow: Default::default(),
            temporal: Default::default(),
            wm: Default::default(),
            hippo: Default::default(),
            consolidation: Default::default(),
            sync: Default::default(),
            action: Default::default(),
        }
    }
}

/// Install the tracing subscriber once for the process. Safe to call more
/// than once; later calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

//─────────────────────────────
//  Topics
//─────────────────────────────

/// Topic accepted writes are published on.
pub const TOPIC_WRITES: &str = "memory.write";
/// Topic encode confirmations are published on.
pub const TOPIC_ENCODED: &str = "memory.encoded";
/// Topic temporal confirmations are published on.
pub const TOPIC_TEMPORAL: &str = "memory.temporal";
/// Topic workspace broadcasts are published on.
pub const TOPIC_WORKSPACE: &str = "workspace";
/// Topic recall queries and results travel on.
pub const TOPIC_RECALL: &str = "recall";
/// Topic consolidation ticks and summaries travel on.
pub const TOPIC_CONSOLIDATION: &str = "consolidation";

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Runtime wiring failures.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A store failed to open.
    #[error("store open failed: {0}")]
    Store(String),
    /// The policy gate refused a write.
    #[error(transparent)]
    Policy(#[from] famos_policy::PolicyError),
    /// A publish was refused.
    #[error("publish failed: {0}")]
    Publish(String),
    /// Bus administration failed.
    #[error("bus error: {0}")]
    Bus(String),
    /// An envelope failed to build.
    #[error("envelope error: {0}")]
    Envelope(String),
    /// Unknown IANA timezone in the configuration.
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
}
