//! CA3 pattern completion: vector + SDR fused scoring.

use async_trait::async_trait;
use dashmap::DashMap;

use famos_types::EventId;

use crate::dg::{DgEncoder, SparseCode};
use crate::HippoError;

//─────────────────────────────
//  Pluggable providers
//─────────────────────────────

/// Embedding provider. Real model inference lives outside the core; tests
/// and degraded operation use [`HashEmbedder`].
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Embed content into a dense vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, HippoError>;

    /// Whether results from this encoder should be marked degraded.
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Vector storage keyed by event id.
pub trait VectorIndex: Send + Sync {
    /// Insert or replace a vector.
    fn upsert(&self, event_id: EventId, vector: Vec<f32>);

    /// Fetch a vector.
    fn get(&self, event_id: &EventId) -> Option<Vec<f32>>;
}

/// In-memory vector index.
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    vectors: DashMap<EventId, Vec<f32>>,
}

impl VectorIndex for InMemoryVectorIndex {
    fn upsert(&self, event_id: EventId, vector: Vec<f32>) {
        self.vectors.insert(event_id, vector);
    }

    fn get(&self, event_id: &EventId) -> Option<Vec<f32>> {
        self.vectors.get(event_id).map(|v| v.clone())
    }
}

//─────────────────────────────
//  Hash embedder fallback
//─────────────────────────────

/// Deterministic 256-dim feature-hash embedder. Always available, never
/// blocks ingest; recall produced from it is tagged degraded.
#[derive(Debug, Clone, Default)]
pub struct HashEmbedder;

/// Dimensionality of hash embeddings.
pub const HASH_EMBED_DIM: usize = 256;

#[async_trait]
impl Encoder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, HippoError> {
        let mut v = vec![0f32; HASH_EMBED_DIM];
        for shingle in DgEncoder::shingles(text) {
            let h = blake3_u64(&shingle);
            let dim = (h % HASH_EMBED_DIM as u64) as usize;
            let sign = if (h >> 63) & 1 == 1 { 1.0 } else { -1.0 };
            v[dim] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }

    fn is_degraded(&self) -> bool {
        true
    }
}

fn blake3_u64(bytes: &[u8]) -> u64 {
    let hash = blake3::hash(bytes);
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("8 bytes"))
}

/// Cosine similarity of two vectors; 0 for mismatched or zero-norm inputs.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na * nb)) as f64
}

//─────────────────────────────
//  Completion scoring
//─────────────────────────────

/// One completion candidate with its fused score and scoring reasons.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Candidate event.
    pub event_id: EventId,
    /// Fused score in `[0, 1]`.
    pub score: f64,
    /// Auditable components, e.g. `vector:cos=0.91`, `sdr:hamm=0.08`.
    pub reasons: Vec<String>,
}

/// Score one candidate against a cue.
///
/// `score = λ·cos + (1−λ)·(1 − d_H/B)` with λ applied only when both sides
/// carry vectors; cosine is clamped at zero so the result stays in `[0, 1]`.
pub fn score_candidate(
    cue_code: &SparseCode,
    cue_vector: Option<&[f32]>,
    candidate_code: &SparseCode,
    candidate_vector: Option<&[f32]>,
    lambda: f64,
) -> (f64, Vec<String>) {
    let hamm = cue_code.simhash.hamming_norm(&candidate_code.simhash);
    let sdr_score = 1.0 - hamm;
    let mut reasons = vec![format!("sdr:hamm={hamm:.3}")];

    match (cue_vector, candidate_vector) {
        (Some(q), Some(v)) => {
            let cos = cosine(q, v).max(0.0);
            reasons.insert(0, format!("vector:cos={cos:.3}"));
            (lambda * cos + (1.0 - lambda) * sdr_score, reasons)
        }
        _ => (sdr_score, reasons),
    }
}
