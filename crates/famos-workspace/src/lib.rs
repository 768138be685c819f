#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **famos-workspace** – Working memory and the global workspace.
//!
//! Each space owns a small set of attention slots. Candidates are scored by
//! a weighted salience sum, softmax-normalized across the batch, and
//! admitted under a per-batch time budget. Slot weights decay with a fixed
//! half-life, near-duplicates merge instead of occupying two slots, and the
//! lowest-weight slot is evicted when the cap is exceeded.
//!
//! On any significant change a `WORKSPACE_BROADCAST` snapshot goes out
//! through the configured sink, debounced so bursts collapse into one
//! latest-wins broadcast per space.

use serde::{Deserialize, Serialize};

mod wm;
mod workspace;

pub use wm::{Candidate, Slot, WorkingMemory};
pub use workspace::{BroadcastSink, ChannelSink, Workspace};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Salience feature weights `(θ_r, θ_q, θ_g, θ_n, θ_t, θ_a, θ_c)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SalienceWeights {
    /// Recency weight.
    pub recency: f64,
    /// Query-match weight.
    pub query_match: f64,
    /// Goal-relevance weight.
    pub goal: f64,
    /// Novelty weight.
    pub novelty: f64,
    /// Time-of-day fit weight.
    pub timefit: f64,
    /// Affect weight.
    pub affect: f64,
    /// Cost penalty weight.
    pub cost: f64,
}

impl Default for SalienceWeights {
    fn default() -> Self {
        Self {
            recency: 1.2,
            query_match: 1.1,
            goal: 0.8,
            novelty: 0.9,
            timefit: 0.5,
            affect: 0.7,
            cost: 0.5,
        }
    }
}

/// Working-memory tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WmConfig {
    /// Slot cap per space.
    pub max_slots: usize,
    /// Decay half-life in seconds.
    pub half_life_s: f64,
    /// Select→score→admit→broadcast budget per batch.
    pub time_budget_ms: u64,
    /// Minimum interval between broadcasts per space.
    pub debounce_ms: u64,
    /// Softmax temperature for batch normalization.
    pub temperature: f64,
    /// Weight bump applied on rehearsal, capped at 1.
    pub rehearsal_bump: f64,
    /// Slots below this weight are dropped on tick.
    pub eviction_floor: f64,
    /// Near-duplicate Hamming threshold used by the merge test.
    pub tau_dedup_hamming: f64,
    /// Near-duplicate Jaccard threshold used by the merge test.
    pub tau_jaccard: f64,
    /// Salience weights.
    pub weights: SalienceWeights,
}

impl Default for WmConfig {
    fn default() -> Self {
        Self {
            max_slots: 8,
            half_life_s: 90.0,
            time_budget_ms: 25,
            debounce_ms: 100,
            temperature: 0.6,
            rehearsal_bump: 0.1,
            eviction_floor: 0.05,
            tau_dedup_hamming: 0.15,
            tau_jaccard: 0.82,
            weights: SalienceWeights::default(),
        }
    }
}

//─────────────────────────────
//  Features & salience
//─────────────────────────────

/// Per-candidate feature vector, all components in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Features {
    /// `2^(-Δt/h)` recency.
    pub recency: f64,
    /// Match against the active query or cue.
    #[serde(rename = "match")]
    pub query_match: f64,
    /// Relevance to the active goal.
    pub goal: f64,
    /// Hippocampal novelty.
    pub novelty: f64,
    /// Circadian fit.
    pub timefit: f64,
    /// Affect salience.
    pub affect: f64,
    /// Estimated processing cost (penalty).
    pub cost: f64,
}

/// Raw salience `S = θ_r·r + θ_q·q + θ_g·g + θ_n·n + θ_t·t + θ_a·a − θ_c·c`.
pub fn salience(f: &Features, w: &SalienceWeights) -> f64 {
    w.recency * f.recency
        + w.query_match * f.query_match
        + w.goal * f.goal
        + w.novelty * f.novelty
        + w.timefit * f.timefit
        + w.affect * f.affect
        - w.cost * f.cost
}

/// Temperature softmax over a batch of salience scores.
///
/// Returned values sum to 1; an empty batch returns an empty vector.
pub fn softmax(scores: &[f64], temperature: f64) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let t = temperature.max(1e-6);
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| ((s - max) / t).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salience_orders_by_weighted_features() {
        let w = SalienceWeights::default();
        let strong = Features {
            recency: 0.9,
            query_match: 0.8,
            novelty: 0.7,
            ..Default::default()
        };
        let weak = Features {
            recency: 0.1,
            cost: 0.9,
            ..Default::default()
        };
        assert!(salience(&strong, &w) > salience(&weak, &w));
    }

    #[test]
    fn softmax_sums_to_one_and_preserves_order() {
        let probs = softmax(&[2.0, 1.0, 0.5], 0.6);
        let sum: f64 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(probs[0] > probs[1] && probs[1] > probs[2]);
    }

    #[test]
    fn softmax_handles_empty_batches() {
        assert!(softmax(&[], 0.6).is_empty());
    }
}
