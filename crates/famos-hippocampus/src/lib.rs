#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **famos-hippocampus** – Sparse episodic encoding and completion.
//!
//! Three stages mirror the biological circuit:
//!
//! - **DG** separates patterns: character shingles become a 512-bit SimHash
//!   plus a 64-permutation MinHash sketch, and new codes are scored for
//!   novelty against their space.
//! - **CA3** completes patterns: a cue is scored against stored codes by a
//!   fused vector-cosine / SDR-Hamming score with auditable reasons.
//! - **CA1** bridges to semantics: coarse entities are extracted and
//!   projected as knowledge-graph triples.
//!
//! Embedding providers are pluggable via [`Encoder`]; when none is
//! configured a deterministic hash embedder keeps recall working in a
//! `degraded` mode rather than blocking ingest.

use serde::{Deserialize, Serialize};

pub mod ca1;
pub mod ca3;
pub mod dg;
mod service;
mod store;

pub use ca3::{cosine, Completion, Encoder, HashEmbedder, InMemoryVectorIndex, VectorIndex};
pub use dg::{jaccard_estimate, DgEncoder, SimHash, SparseCode, SIMHASH_BITS};
pub use service::{EncodeOutcome, Hippocampus};
pub use store::{CodeRecord, CodeStore};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Hippocampus tuning knobs; defaults follow the recognized config keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HippoConfig {
    /// MinHash permutations.
    pub minhash_k: usize,
    /// Near-duplicate Hamming threshold as a fraction of the code width.
    pub tau_dedup_hamming: f64,
    /// Near-duplicate Jaccard threshold.
    pub tau_jaccard: f64,
    /// Novelty slope `α` applied to the normalized Hamming distance.
    pub novelty_alpha: f64,
    /// Duplicate-rate penalty `β`.
    pub novelty_beta: f64,
    /// Vector/SDR fusion weight `λ` when embeddings are available.
    pub lambda: f64,
}

impl Default for HippoConfig {
    fn default() -> Self {
        Self {
            minhash_k: 64,
            tau_dedup_hamming: 0.15,
            tau_jaccard: 0.82,
            novelty_alpha: 6.0,
            novelty_beta: 1.0,
            lambda: 0.7,
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Hippocampus failures.
#[derive(Debug, thiserror::Error)]
pub enum HippoError {
    /// Underlying sled failure.
    #[error("code store error: {0}")]
    Store(#[from] sled::Error),
    /// Record encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),
    /// The configured external encoder failed (recall degrades, ingest
    /// continues on the hash embedder).
    #[error("encoder unavailable: {0}")]
    EncoderUnavailable(String),
}

/// Logistic squashing used by the novelty score.
pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
