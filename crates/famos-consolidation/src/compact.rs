//! Duplicate compaction: composite scoring and canonical election.

use std::collections::BTreeSet;

use famos_hippocampus::{jaccard_estimate, DgEncoder};
use famos_types::{Band, EventId};

use crate::{ConsolidationConfig, Episode};

/// A merged duplicate group.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    /// Elected exemplar.
    pub canonical: EventId,
    /// Events merged into it.
    pub duplicates: Vec<EventId>,
}

/// Result of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionOutcome {
    /// Groups merged this pass.
    pub groups: Vec<DuplicateGroup>,
}

/// Token-set cosine similarity, the cheap stand-in for embedding cosine in
/// the composite score.
fn token_cosine(a: &str, b: &str) -> f64 {
    let ta: BTreeSet<String> = tokens(a);
    let tb: BTreeSet<String> = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let inter = ta.intersection(&tb).count() as f64;
    inter / ((ta.len() as f64).sqrt() * (tb.len() as f64).sqrt())
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Composite similarity:
/// `S = 0.45·Jaccard3g + 0.45·cos + 0.05·[Δt < τ] + 0.05·[same author]`.
pub(crate) fn composite_similarity(
    a: &Episode,
    b: &Episode,
    code_jaccard: f64,
    proximity_window_s: i64,
) -> f64 {
    let cos = token_cosine(&a.text, &b.text);
    let close_in_time = ((a.ts - b.ts).num_seconds().abs() < proximity_window_s) as u8 as f64;
    let same_author = (a.author == b.author) as u8 as f64;
    0.45 * code_jaccard + 0.45 * cos + 0.05 * close_in_time + 0.05 * same_author
}

/// Compact one space's episodes into duplicate groups.
///
/// RED/BLACK episodes never participate. Within an LSH candidate group,
/// pairs at or above the merge threshold coalesce; the canonical exemplar is
/// the longest text, ties broken by affect confidence then earliest
/// timestamp.
pub fn compact(episodes: &[Episode], config: &ConsolidationConfig) -> CompactionOutcome {
    let eligible: Vec<&Episode> = episodes
        .iter()
        .filter(|e| e.band < Band::Red)
        .collect();
    if eligible.len() < 2 {
        return CompactionOutcome::default();
    }

    let encoder = DgEncoder::new(64);
    let codes: Vec<_> = eligible.iter().map(|e| encoder.encode(&e.text)).collect();

    let mut outcome = CompactionOutcome::default();
    for group in crate::lsh::candidate_groups(&codes) {
        // Confirm candidates pairwise; LSH only proposes.
        let mut confirmed: Vec<usize> = Vec::new();
        for &idx in &group {
            let matches_any = confirmed.iter().any(|&other| {
                let jac = jaccard_estimate(&codes[idx].minhash, &codes[other].minhash);
                composite_similarity(
                    eligible[idx],
                    eligible[other],
                    jac,
                    config.proximity_window_s,
                ) >= config.merge_threshold
            });
            if confirmed.is_empty() || matches_any {
                confirmed.push(idx);
            }
        }
        if confirmed.len() < 2 {
            continue;
        }

        let canonical_idx = confirmed
            .iter()
            .copied()
            .max_by(|&a, &b| {
                let ea = eligible[a];
                let eb = eligible[b];
                ea.text
                    .len()
                    .cmp(&eb.text.len())
                    .then(
                        ea.affect_confidence
                            .partial_cmp(&eb.affect_confidence)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    // Earliest timestamp wins the final tie.
                    .then(eb.ts.cmp(&ea.ts))
            })
            .expect("confirmed is non-empty");

        let canonical = eligible[canonical_idx].event_id;
        let duplicates: Vec<EventId> = confirmed
            .iter()
            .filter(|&&i| i != canonical_idx)
            .map(|&i| eligible[i].event_id)
            .collect();
        tracing::debug!(
            canonical = %canonical,
            merged = duplicates.len(),
            "duplicate group compacted"
        );
        outcome.groups.push(DuplicateGroup {
            canonical,
            duplicates,
        });
    }
    outcome
}
