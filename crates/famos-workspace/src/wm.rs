//! Per-space working memory: slots, decay, merge, eviction, rehearsal.

use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

use famos_hippocampus::{jaccard_estimate, SparseCode};
use famos_types::EventId;

use crate::{salience, softmax, Features, WmConfig};

/// A candidate offered for admission.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Event the candidate refers to.
    pub event_id: EventId,
    /// Scored features.
    pub features: Features,
    /// Short summary carried into broadcasts; never raw content.
    pub summary: String,
    /// Sparse code for the near-duplicate merge test, when available.
    pub code: Option<SparseCode>,
}

/// One attention slot.
#[derive(Debug, Clone)]
pub struct Slot {
    /// Held event.
    pub event_id: EventId,
    /// Attention weight in `[0, 1]`.
    pub weight: f64,
    /// Instant the slot is projected to decay below the eviction floor.
    pub expires_at: DateTime<Utc>,
    /// Features at admission (merged upward on duplicate merges).
    pub features: Features,
    /// Broadcast summary.
    pub summary: String,
    /// Sparse code for merge tests.
    pub code: Option<SparseCode>,
    last_decay: DateTime<Utc>,
}

/// Bounded, decaying slot set for one space.
#[derive(Debug)]
pub struct WorkingMemory {
    config: WmConfig,
    slots: Vec<Slot>,
}

impl WorkingMemory {
    /// Empty working memory.
    pub fn new(config: WmConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
        }
    }

    /// Current slots, strongest first.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Whether `event_id` currently holds a slot.
    pub fn contains(&self, event_id: &EventId) -> bool {
        self.slots.iter().any(|s| s.event_id == *event_id)
    }

    /// Score and admit a batch of candidates at `now`.
    ///
    /// Near-duplicates of an existing slot merge into it (weight and
    /// features take the maximum). Candidates are processed in descending
    /// salience and the batch stops once the time budget is exhausted, so
    /// the cheapest-to-skip work is the least salient. Returns true when
    /// the slot set changed.
    pub fn admit_batch(&mut self, mut candidates: Vec<Candidate>, now: DateTime<Utc>) -> bool {
        if candidates.is_empty() {
            return false;
        }
        let started = Instant::now();
        let budget = std::time::Duration::from_millis(self.config.time_budget_ms);

        let scores: Vec<f64> = candidates
            .iter()
            .map(|c| salience(&c.features, &self.config.weights))
            .collect();
        let probs = softmax(&scores, self.config.temperature);
        let max_prob = probs.iter().cloned().fold(f64::MIN, f64::max).max(1e-9);

        // Pair, then order by descending salience for greedy admission.
        let mut scored: Vec<(f64, f64, usize)> = scores
            .iter()
            .zip(probs.iter())
            .enumerate()
            .map(|(idx, (s, p))| (*s, p / max_prob, idx))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        self.decay(now);
        let mut changed = false;
        for (_, weight, idx) in scored {
            if started.elapsed() > budget {
                tracing::debug!("admission budget exhausted, trimming tail candidates");
                break;
            }
            let candidate = &mut candidates[idx];
            let candidate = Candidate {
                event_id: candidate.event_id,
                features: candidate.features,
                summary: std::mem::take(&mut candidate.summary),
                code: candidate.code.take(),
            };
            changed |= self.admit_one(candidate, weight.clamp(0.0, 1.0), now);
        }
        changed |= self.enforce_cap();
        changed
    }

    fn admit_one(&mut self, candidate: Candidate, weight: f64, now: DateTime<Utc>) -> bool {
        let config = self.config.clone();

        // Same event: treat as rehearsal.
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.event_id == candidate.event_id)
        {
            slot.weight = slot.weight.max(weight).min(1.0);
            slot.features = merge_features(&slot.features, &candidate.features);
            slot.expires_at = expiry_for(&config, slot.weight, now);
            return true;
        }

        // Near-duplicate of an existing slot: merge instead of admitting.
        if let Some(code) = &candidate.code {
            if let Some(slot) = self.slots.iter_mut().find(|s| {
                s.code.as_ref().is_some_and(|sc| {
                    sc.simhash.hamming_norm(&code.simhash) <= config.tau_dedup_hamming
                        || jaccard_estimate(&sc.minhash, &code.minhash) >= config.tau_jaccard
                })
            }) {
                slot.weight = slot.weight.max(weight).min(1.0);
                slot.features = merge_features(&slot.features, &candidate.features);
                slot.expires_at = expiry_for(&config, slot.weight, now);
                return true;
            }
        }

        let expires_at = expiry_for(&config, weight, now);
        self.slots.push(Slot {
            event_id: candidate.event_id,
            weight,
            expires_at,
            features: candidate.features,
            summary: candidate.summary,
            code: candidate.code,
            last_decay: now,
        });
        true
    }

    /// Apply exponential decay up to `now` and drop slots below the floor.
    /// Returns true when the slot set changed.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        let before = self.slots.len();
        self.decay(now);
        let floor = self.config.eviction_floor;
        self.slots.retain(|s| s.weight >= floor);
        let changed = self.slots.len() != before;
        self.sort_slots();
        changed
    }

    fn decay(&mut self, now: DateTime<Utc>) {
        let h_ms = self.config.half_life_s * 1000.0;
        for slot in &mut self.slots {
            let dt_ms = (now - slot.last_decay).num_milliseconds().max(0) as f64;
            if dt_ms > 0.0 {
                slot.weight *= (0.5f64).powf(dt_ms / h_ms);
                slot.last_decay = now;
            }
        }
    }

    fn enforce_cap(&mut self) -> bool {
        self.sort_slots();
        let changed = self.slots.len() > self.config.max_slots;
        self.slots.truncate(self.config.max_slots);
        changed
    }

    fn sort_slots(&mut self) {
        self.slots.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
    }

    /// Rehearsal: bump a held event's weight, capped at 1.
    pub fn rehearse(&mut self, event_id: &EventId, now: DateTime<Utc>) -> bool {
        self.decay(now);
        let config = self.config.clone();
        let mut rehearsed = false;
        for slot in &mut self.slots {
            if slot.event_id == *event_id {
                slot.weight = (slot.weight + config.rehearsal_bump).min(1.0);
                slot.expires_at = expiry_for(&config, slot.weight, now);
                rehearsed = true;
                break;
            }
        }
        if rehearsed {
            self.sort_slots();
        }
        rehearsed
    }
}

/// Project when a weight decays below the eviction floor:
/// solve `w · 0.5^(Δt/h) = floor` for `Δt`.
fn expiry_for(config: &WmConfig, weight: f64, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = config.eviction_floor.max(1e-6);
    if weight <= floor {
        return now;
    }
    let half_lives = (weight / floor).log2();
    now + Duration::milliseconds((half_lives * config.half_life_s * 1000.0) as i64)
}

fn merge_features(a: &Features, b: &Features) -> Features {
    Features {
        recency: a.recency.max(b.recency),
        query_match: a.query_match.max(b.query_match),
        goal: a.goal.max(b.goal),
        novelty: a.novelty.max(b.novelty),
        timefit: a.timefit.max(b.timefit),
        affect: a.affect.max(b.affect),
        cost: a.cost.min(b.cost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use famos_hippocampus::DgEncoder;
    use uuid::Uuid;

    fn candidate(recency: f64, text: Option<&str>) -> Candidate {
        Candidate {
            event_id: Uuid::new_v4(),
            features: Features {
                recency,
                ..Default::default()
            },
            summary: "s".into(),
            code: text.map(|t| DgEncoder::new(64).encode(t)),
        }
    }

    #[test]
    fn slot_count_never_exceeds_the_cap() {
        let mut wm = WorkingMemory::new(WmConfig::default());
        let now = Utc::now();
        let candidates: Vec<Candidate> = (0..20)
            .map(|i| candidate(0.5 + (i as f64) * 0.01, None))
            .collect();
        wm.admit_batch(candidates, now);
        assert!(wm.slots().len() <= 8);
    }

    #[test]
    fn eviction_drops_the_minimum_weight() {
        let mut config = WmConfig::default();
        config.max_slots = 2;
        let mut wm = WorkingMemory::new(config);
        let now = Utc::now();
        let strong = candidate(0.9, None);
        let medium = candidate(0.5, None);
        let weak = candidate(0.1, None);
        let weak_id = weak.event_id;
        wm.admit_batch(vec![strong, medium, weak], now);
        assert_eq!(wm.slots().len(), 2);
        assert!(!wm.contains(&weak_id));
    }

    #[test]
    fn weights_decay_with_the_half_life() {
        let mut wm = WorkingMemory::new(WmConfig::default());
        let now = Utc::now();
        wm.admit_batch(vec![candidate(0.9, None)], now);
        let w0 = wm.slots()[0].weight;

        let later = now + Duration::seconds(90);
        wm.tick(later);
        let w1 = wm.slots()[0].weight;
        assert!((w1 - w0 / 2.0).abs() < 0.02, "w0={w0} w1={w1}");
    }

    #[test]
    fn decayed_out_slots_are_evicted() {
        let mut wm = WorkingMemory::new(WmConfig::default());
        let now = Utc::now();
        wm.admit_batch(vec![candidate(0.9, None)], now);
        wm.tick(now + Duration::seconds(3600));
        assert!(wm.slots().is_empty());
    }

    #[test]
    fn near_duplicates_merge_into_one_slot() {
        let mut wm = WorkingMemory::new(WmConfig::default());
        let now = Utc::now();
        let base = "Grocery run after work, remember milk eggs and the bread Sofia likes. \
                    Pharmacy closes at seven so go there first.";
        let extended = format!("{base} Also pick up the dry cleaning.");
        wm.admit_batch(vec![candidate(0.8, Some(base))], now);
        wm.admit_batch(vec![candidate(0.7, Some(&extended))], now);
        assert_eq!(wm.slots().len(), 1);
    }

    #[test]
    fn rehearsal_bumps_and_caps_at_one() {
        let mut wm = WorkingMemory::new(WmConfig::default());
        let now = Utc::now();
        let c = candidate(0.9, None);
        let id = c.event_id;
        wm.admit_batch(vec![c], now);
        for _ in 0..20 {
            wm.rehearse(&id, now);
        }
        assert!(wm.slots()[0].weight <= 1.0);
        assert!(wm.slots()[0].weight > 0.9);
    }
}
