#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **famos-consolidation** – Background memory maintenance.
//!
//! Runs as a durable consumer of `CONSOLIDATION_TICK` events, each tick
//! opening a time budget:
//!
//! - **Compaction** finds near-duplicate episode groups via MinHash LSH,
//!   scores them with a composite similarity, elects a canonical exemplar,
//!   and packs the duplicates' content into period pack files with
//!   block-level dedup. RED/BLACK material is never compacted.
//! - **Rollups** produce extractive period summaries: sentences ranked by
//!   MMR over tf-idf and recency, lightly rewritten, within a token budget,
//!   with highlights and full provenance.
//! - **Reconsolidation** patches a rollup in place for local late evidence,
//!   or versions it with a diff, always leaving an audit record.
//! - **KG projection** extracts pattern-based relations from rollup text and
//!   appends them with timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use famos_types::{Band, EventId, SpaceId};

mod compact;
mod engine;
mod kg;
mod lsh;
mod pack;
mod recon;
mod rollup;

pub use compact::{CompactionOutcome, DuplicateGroup};
pub use engine::{ConsolidationEngine, PassSummary};
pub use kg::{project_relations, KgStore};
pub use lsh::candidate_groups;
pub use pack::PackStore;
pub use recon::{reconsolidate, ReconAction, ReconOutcome};
pub use rollup::{build_rollup, Period, Rollup, RollupStore};

//─────────────────────────────
//  Inputs
//─────────────────────────────

/// A consolidatable episode as seen by the engine. The episodic store
/// itself lives behind [`EpisodeSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Event id.
    pub event_id: EventId,
    /// Owning space.
    pub space_id: SpaceId,
    /// Event timestamp.
    pub ts: DateTime<Utc>,
    /// Post-gate text (already redacted where obligations applied).
    pub text: String,
    /// Author.
    pub author: String,
    /// Sensitivity band.
    pub band: Band,
    /// Confidence of the affect annotation, used by canonical election.
    pub affect_confidence: f64,
}

/// Where the engine reads episodes from.
pub trait EpisodeSource: Send + Sync {
    /// Episodes of a space inside `[from, to)`, any order.
    fn episodes_in(
        &self,
        space: &SpaceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Episode>>;
}

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Consolidation tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Budget for an idle tick.
    pub idle_budget_ms: u64,
    /// Budget for the nightly tick.
    pub nightly_budget_ms: u64,
    /// Token budget for a day rollup.
    pub tokens_per_day: usize,
    /// Token budget for a week rollup.
    pub tokens_per_week: usize,
    /// Composite-similarity threshold for merging duplicates.
    pub merge_threshold: f64,
    /// Δt window (seconds) granting the temporal-proximity term.
    pub proximity_window_s: i64,
    /// MMR relevance weight λ.
    pub mmr_lambda: f64,
    /// MMR redundancy penalty μ.
    pub mmr_mu: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            idle_budget_ms: 2_000,
            nightly_budget_ms: 30_000,
            tokens_per_day: 400,
            tokens_per_week: 1_200,
            merge_threshold: 0.86,
            proximity_window_s: 3_600,
            mmr_lambda: 0.7,
            mmr_mu: 0.3,
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Consolidation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConsolidationError {
    /// Underlying sled failure.
    #[error("consolidation store error: {0}")]
    Store(#[from] sled::Error),
    /// Pack or rollup file IO failed.
    #[error("consolidation io error: {0}")]
    Io(#[from] std::io::Error),
    /// Record encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),
    /// Episode source failure.
    #[error("episode source error: {0}")]
    Source(String),
}
