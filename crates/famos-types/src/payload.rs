//! Typed payload schemas for the event catalog.
//!
//! Envelopes carry payloads as JSON values; these structs are the schemas
//! producers serialize from and consumers deserialize into, keyed by
//! [`crate::EventType`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventId, SpaceId};

/// `WRITE_ACCEPTED` – a gate-approved write entering the durable pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAccepted {
    /// Stable id of the written event.
    pub event_id: String,
    /// Producer timestamp of the content.
    pub ts: DateTime<Utc>,
    /// Free text of the write (already redacted per obligations).
    pub text: String,
    /// Caller-supplied tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// `HIPPO_ENCODE` – confirmation that an accepted write was encoded into
/// hippocampal codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HippoEncode {
    /// Event that was encoded.
    pub event_id: String,
    /// SimHash width in bits.
    pub simhash_bits: usize,
    /// MinHash permutation count.
    pub minhash_k: usize,
    /// Novelty score in `[0, 1]`.
    pub novelty: f64,
    /// Pre-existing near-duplicates detected in the space.
    #[serde(default)]
    pub near_duplicates: Vec<String>,
    /// True when the fallback embedder produced the vector.
    #[serde(default)]
    pub degraded: bool,
}

/// `TEMPORAL_INDEX_BUILT` – shard membership confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalIndexBuilt {
    /// Indexed event.
    pub event_id: String,
    /// Bucket keys the event landed in, one per resolution.
    pub buckets: Vec<String>,
}

/// `RECALL_QUERY` – user-level recall request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallQuery {
    /// Relative time phrase, e.g. `"yesterday morning"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phrase: Option<String>,
    /// Content cue for CA3 completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cue: Option<String>,
    /// Caller's "now" anchor.
    pub now: DateTime<Utc>,
    /// IANA timezone name the phrase is anchored to.
    pub tz: String,
    /// Result budget.
    pub k: usize,
}

/// One scored hit inside a `RECALL_RESULT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallHit {
    /// Recalled event.
    pub event_id: String,
    /// Event timestamp.
    pub ts: DateTime<Utc>,
    /// Combined score in `[0, 1]`.
    pub score: f64,
    /// Recency component `2^(-Δt/h)`.
    pub recency: f64,
    /// Human-auditable scoring reasons (`vector:cos=…`, `sdr:hamm=…`).
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// `RECALL_RESULT` – fused recall response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallResult {
    /// Ordered hits, best first.
    pub hits: Vec<RecallHit>,
    /// True when a fallback encoder produced the scores.
    #[serde(default)]
    pub degraded: bool,
}

/// One slot inside a `WORKSPACE_BROADCAST`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastSlot {
    /// Event held in the slot.
    pub event_id: String,
    /// Current attention weight in `[0, 1]`.
    pub weight: f64,
    /// Short summary; never raw content.
    pub summary: String,
}

/// `WORKSPACE_BROADCAST` – debounced working-memory snapshot for a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceBroadcast {
    /// Space the snapshot belongs to.
    pub space_id: SpaceId,
    /// Ordered slots, strongest first.
    pub slots: Vec<BroadcastSlot>,
}

/// `CONSOLIDATION_TICK` – opens a consolidation budget window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickKind {
    /// Opportunistic idle window.
    Idle,
    /// Nightly window.
    Nightly,
    /// Weekly window.
    Weekly,
}

/// Payload of a `CONSOLIDATION_TICK`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationTick {
    /// Window class.
    pub kind: TickKind,
    /// Time budget for the pass.
    pub budget_ms: u64,
}

/// `CONSOLIDATION_DONE` – summary of a finished pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationDone {
    /// Window class that ran.
    pub kind: TickKind,
    /// Duplicate groups merged.
    pub groups_merged: usize,
    /// Rollups written.
    pub rollups_written: usize,
    /// KG triples appended.
    pub triples_appended: usize,
}

/// `ACTION_EXECUTED` – receipt summary published after tool dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecuted {
    /// Executed tool.
    pub tool_id: String,
    /// Terminal receipt status.
    pub status: String,
    /// Receipt idempotency key.
    pub idempotency_key: String,
    /// Wall-clock execution duration.
    pub duration_ms: u64,
}

/// Gating context consulted before a prospective trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct GatingContext {
    /// Current arousal estimate in `[0, 1]`.
    pub arousal: f64,
    /// Current safety pressure in `[0, 1]`.
    pub safety_pressure: f64,
}

/// `PROS_TRIGGER_FIRED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFired {
    /// Trigger that fired.
    pub trigger_id: String,
    /// Fitness-to-fire score the gate computed.
    pub eligibility: f64,
    /// Next slot, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// `PROS_TRIGGER_SKIPPED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSkipped {
    /// Trigger that was due but refused.
    pub trigger_id: String,
    /// Why the slot was skipped, e.g. `"arousal_too_high"`.
    pub reason: String,
    /// Eligibility score that fell short.
    pub eligibility: f64,
    /// Next slot, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// A single subject–predicate–object triple projected into the KG.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    /// Subject, usually `event:<id>`.
    pub subject: String,
    /// Predicate, e.g. `has_time`, `has_topic`, `mentions`.
    pub predicate: String,
    /// Object value.
    pub object: String,
    /// When the fact was observed.
    pub observed_at: DateTime<Utc>,
}

impl Triple {
    /// Conventional subject form for an event.
    pub fn event_subject(event_id: &EventId) -> String {
        format!("event:{}", event_id.simple())
    }
}
