//! Fixed catalog of envelope types crossing module boundaries.

use serde::{Deserialize, Serialize};

/// Every envelope carries exactly one type from this catalog. The variants
/// mirror the pipeline stages: write/ingest, temporal, workspace, recall,
/// consolidation, action, prospective, and replicator-internal sync frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EventType {
    // Write / ingest
    /// A gate-approved write entering the durable pipeline.
    WriteAccepted,
    /// Request to encode an accepted write into hippocampal codes.
    HippoEncode,

    // Temporal
    /// Confirmation that an event landed in all covering time shards.
    TemporalIndexBuilt,
    /// Relative-phrase range query request.
    TemporalRangeRequest,
    /// Ordered range query response.
    TemporalRangeResponse,

    // Workspace
    /// Debounced snapshot of a space's working-memory slots.
    WorkspaceBroadcast,

    // Recall
    /// User-level recall query (phrase and/or cue text).
    RecallQuery,
    /// Internal recall fan-out request.
    RecallRequest,
    /// Fused recall result.
    RecallResult,

    // Consolidation
    /// Periodic tick opening a consolidation budget window.
    ConsolidationTick,
    /// Consolidation pass summary.
    ConsolidationDone,

    // Actions
    /// A decision to execute a tool.
    ActionDecision,
    /// Receipt summary of a tool execution.
    ActionExecuted,

    // Prospective
    /// Trigger created or updated.
    ProsTriggerUpsert,
    /// Trigger fired and produced its action envelope.
    ProsTriggerFired,
    /// Trigger eligible slot skipped (gating context refused it).
    ProsTriggerSkipped,
    /// Trigger snoozed by a user.
    ProsTriggerSnoozed,
    /// Trigger cancelled.
    ProsTriggerCancelled,

    // Sync (internal to the replicator transport)
    /// Session opener with per-space op counts.
    SyncHello,
    /// Session opener acknowledgement.
    SyncAck,
    /// Chunked inventory of op ids.
    SyncInv,
    /// Request for missing ops.
    SyncGet,
    /// Batch of full ops.
    SyncOps,
}

impl EventType {
    /// Stable SCREAMING_SNAKE name used in logs and wire payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WriteAccepted => "WRITE_ACCEPTED",
            EventType::HippoEncode => "HIPPO_ENCODE",
            EventType::TemporalIndexBuilt => "TEMPORAL_INDEX_BUILT",
            EventType::TemporalRangeRequest => "TEMPORAL_RANGE_REQUEST",
            EventType::TemporalRangeResponse => "TEMPORAL_RANGE_RESPONSE",
            EventType::WorkspaceBroadcast => "WORKSPACE_BROADCAST",
            EventType::RecallQuery => "RECALL_QUERY",
            EventType::RecallRequest => "RECALL_REQUEST",
            EventType::RecallResult => "RECALL_RESULT",
            EventType::ConsolidationTick => "CONSOLIDATION_TICK",
            EventType::ConsolidationDone => "CONSOLIDATION_DONE",
            EventType::ActionDecision => "ACTION_DECISION",
            EventType::ActionExecuted => "ACTION_EXECUTED",
            EventType::ProsTriggerUpsert => "PROS_TRIGGER_UPSERT",
            EventType::ProsTriggerFired => "PROS_TRIGGER_FIRED",
            EventType::ProsTriggerSkipped => "PROS_TRIGGER_SKIPPED",
            EventType::ProsTriggerSnoozed => "PROS_TRIGGER_SNOOZED",
            EventType::ProsTriggerCancelled => "PROS_TRIGGER_CANCELLED",
            EventType::SyncHello => "HELLO",
            EventType::SyncAck => "ACK",
            EventType::SyncInv => "INV",
            EventType::SyncGet => "GET",
            EventType::SyncOps => "OPS",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
