//! The hippocampus facade combining DG, CA3, and the code store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use famos_types::{EventId, SpaceId};

use crate::ca3::{score_candidate, Completion, Encoder, HashEmbedder, VectorIndex};
use crate::dg::{jaccard_estimate, DgEncoder, SparseCode};
use crate::store::{new_record, CodeRecord, CodeStore};
use crate::{sigmoid, HippoConfig, HippoError};

/// Result of encoding one event.
#[derive(Debug, Clone)]
pub struct EncodeOutcome {
    /// The stored record.
    pub record: CodeRecord,
    /// Novelty in `[0, 1]`; 1.0 for the first event in a space.
    pub novelty: f64,
    /// Pre-existing near-duplicates of this event in the same space.
    pub near_duplicates: Vec<EventId>,
    /// True when the fallback embedder produced the vector.
    pub degraded: bool,
}

/// Hippocampus service. Holds the pluggable embedding provider and vector
/// index alongside the durable code store.
pub struct Hippocampus {
    config: HippoConfig,
    dg: DgEncoder,
    store: CodeStore,
    encoder: Option<Arc<dyn Encoder>>,
    fallback: HashEmbedder,
    vectors: Arc<dyn VectorIndex>,
}

impl Hippocampus {
    /// Build the service. Pass `None` for `encoder` to run on the hash
    /// embedder permanently (all recall marked degraded).
    pub fn new(
        db: &sled::Db,
        config: HippoConfig,
        encoder: Option<Arc<dyn Encoder>>,
        vectors: Arc<dyn VectorIndex>,
    ) -> Result<Self, HippoError> {
        Ok(Self {
            dg: DgEncoder::new(config.minhash_k),
            store: CodeStore::open(db)?,
            config,
            encoder,
            fallback: HashEmbedder,
            vectors,
        })
    }

    /// Access the underlying code store.
    pub fn store(&self) -> &CodeStore {
        &self.store
    }

    /// Near-duplicate test shared with working memory and consolidation.
    pub fn is_near_duplicate(&self, a: &SparseCode, b: &SparseCode) -> bool {
        a.simhash.hamming_norm(&b.simhash) <= self.config.tau_dedup_hamming
            || jaccard_estimate(&a.minhash, &b.minhash) >= self.config.tau_jaccard
    }

    async fn embed(&self, text: &str) -> (Vec<f32>, bool) {
        if let Some(encoder) = &self.encoder {
            match encoder.embed(text).await {
                Ok(v) => return (v, encoder.is_degraded()),
                Err(e) => {
                    warn!(error = %e, "encoder failed, falling back to hash embeddings");
                }
            }
        }
        let v = self
            .fallback
            .embed(text)
            .await
            .unwrap_or_default();
        (v, true)
    }

    /// DG stage: encode an event, score novelty, detect near-duplicates,
    /// persist the code, and index its vector. Never blocks on the external
    /// encoder; a failure degrades to hash embeddings.
    pub async fn encode_event(
        &self,
        space: &SpaceId,
        event_id: EventId,
        text: &str,
        ts: DateTime<Utc>,
        meta_hint: Option<String>,
    ) -> Result<EncodeOutcome, HippoError> {
        let code = self.dg.encode(text);
        let live = self.store.live_in_space(space)?;

        let mut min_hamm = f64::INFINITY;
        let mut near_duplicates = Vec::new();
        for other in live.iter().filter(|r| r.event_id != event_id) {
            let hamm = code.simhash.hamming_norm(&other.code.simhash);
            min_hamm = min_hamm.min(hamm);
            if hamm <= self.config.tau_dedup_hamming
                || jaccard_estimate(&code.minhash, &other.code.minhash) >= self.config.tau_jaccard
            {
                near_duplicates.push(other.event_id);
            }
        }
        let compared = live.iter().filter(|r| r.event_id != event_id).count();
        let novelty = if compared == 0 {
            1.0
        } else {
            let dup_rate = near_duplicates.len() as f64 / compared as f64;
            sigmoid(self.config.novelty_alpha * min_hamm - self.config.novelty_beta * dup_rate)
        };

        let (vector, degraded) = self.embed(text).await;
        self.vectors.upsert(event_id, vector);

        let record = new_record(event_id, space.clone(), code, ts, meta_hint);
        self.store.put(&record)?;
        tracing::debug!(
            space = %space,
            event = %event_id,
            novelty,
            near_duplicates = near_duplicates.len(),
            degraded,
            "hippocampal encode"
        );

        Ok(EncodeOutcome {
            record,
            novelty,
            near_duplicates,
            degraded,
        })
    }

    /// CA3 stage: complete a cue against a space's live codes.
    ///
    /// Returns scored candidates (best first, capped at `k`) and whether the
    /// scoring ran degraded.
    pub async fn complete(
        &self,
        space: &SpaceId,
        cue: &str,
        k: usize,
    ) -> Result<(Vec<Completion>, bool), HippoError> {
        let cue_code = self.dg.encode(cue);
        let (cue_vector, degraded) = self.embed(cue).await;
        let live = self.store.live_in_space(space)?;

        let mut completions: Vec<Completion> = live
            .iter()
            .map(|record| {
                let candidate_vector = self.vectors.get(&record.event_id);
                let (score, reasons) = score_candidate(
                    &cue_code,
                    Some(cue_vector.as_slice()).filter(|v| !v.is_empty()),
                    &record.code,
                    candidate_vector.as_deref(),
                    self.config.lambda,
                );
                Completion {
                    event_id: record.event_id,
                    score,
                    reasons,
                }
            })
            .collect();
        completions.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        completions.truncate(k);
        Ok((completions, degraded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca3::InMemoryVectorIndex;
    use famos_types::SpaceKind;
    use uuid::Uuid;

    fn service() -> (tempfile::TempDir, Hippocampus) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("hippo")).unwrap();
        let hippo = Hippocampus::new(
            &db,
            HippoConfig::default(),
            None,
            Arc::new(InMemoryVectorIndex::default()),
        )
        .unwrap();
        (dir, hippo)
    }

    fn space() -> SpaceId {
        SpaceId::new(SpaceKind::Shared, "household").unwrap()
    }

    #[tokio::test]
    async fn first_event_in_a_space_is_maximally_novel() {
        let (_dir, hippo) = service();
        let outcome = hippo
            .encode_event(&space(), Uuid::new_v4(), "dinner plan", Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(outcome.novelty, 1.0);
        assert!(outcome.near_duplicates.is_empty());
        assert!(outcome.degraded, "no encoder configured means degraded");
    }

    #[tokio::test]
    async fn near_duplicate_is_detected_and_lowers_novelty() {
        let (_dir, hippo) = service();
        let base = "Grocery run after work, remember milk eggs and the bread Sofia likes. \
                    Pharmacy closes at seven so go there first.";
        let first = Uuid::new_v4();
        hippo
            .encode_event(&space(), first, base, Utc::now(), None)
            .await
            .unwrap();

        let extended = format!("{base} Also pick up the dry cleaning.");
        let outcome = hippo
            .encode_event(&space(), Uuid::new_v4(), &extended, Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(outcome.near_duplicates, vec![first]);
        assert!(outcome.novelty < 0.6, "novelty {} too high", outcome.novelty);
    }

    #[tokio::test]
    async fn completion_ranks_the_matching_event_first() {
        let (_dir, hippo) = service();
        let pickup = Uuid::new_v4();
        hippo
            .encode_event(
                &space(),
                pickup,
                "Morning note about school pickup",
                Utc::now(),
                None,
            )
            .await
            .unwrap();
        hippo
            .encode_event(
                &space(),
                Uuid::new_v4(),
                "Quarterly tax filing deadline approaching",
                Utc::now(),
                None,
            )
            .await
            .unwrap();

        let (completions, degraded) = hippo
            .complete(&space(), "school pickup", 5)
            .await
            .unwrap();
        assert!(degraded);
        assert_eq!(completions[0].event_id, pickup);
        assert!(completions[0].score >= completions[1].score);
        assert!(completions
            .iter()
            .all(|c| (0.0..=1.0).contains(&c.score)));
        assert!(completions[0]
            .reasons
            .iter()
            .any(|r| r.starts_with("vector:cos=") || r.starts_with("sdr:hamm=")));
    }

    #[tokio::test]
    async fn completion_never_crosses_spaces() {
        let (_dir, hippo) = service();
        let other = SpaceId::new(SpaceKind::Personal, "alice").unwrap();
        hippo
            .encode_event(&other, Uuid::new_v4(), "secret diary entry", Utc::now(), None)
            .await
            .unwrap();
        let (completions, _) = hippo.complete(&space(), "secret diary", 5).await.unwrap();
        assert!(completions.is_empty());
    }
}
