//! Durable consumer-group handlers wiring the pipelines together.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use tracing::{debug, warn};

use famos_bus::{DurableBus, EventHandler, HandlerOutcome};
use famos_consolidation::ConsolidationEngine;
use famos_hippocampus::Hippocampus;
use famos_temporal::{parse_phrase, TemporalIndex};
use famos_types::payload::{
    ConsolidationDone, ConsolidationTick, HippoEncode, RecallHit, RecallQuery, RecallResult,
    TemporalIndexBuilt, WorkspaceBroadcast, WriteAccepted,
};
use famos_types::{Envelope, EventType, SpaceId};
use famos_workspace::{BroadcastSink, Candidate, Features, Workspace};

use crate::episodes::EpisodeStore;
use crate::{TOPIC_CONSOLIDATION, TOPIC_ENCODED, TOPIC_TEMPORAL, TOPIC_WORKSPACE};

/// Publishes a derived envelope, treating back-pressure as retryable.
async fn publish_derived(
    bus: &Arc<DurableBus>,
    envelope: Envelope,
) -> Result<(), HandlerOutcome> {
    match bus.publish(envelope).await {
        Ok(_) => Ok(()),
        Err(famos_bus::PublishError::BackPressure { .. }) => {
            Err(HandlerOutcome::retry("bus back-pressure"))
        }
        Err(famos_bus::PublishError::Io(e)) => Err(HandlerOutcome::retry(e.to_string())),
        Err(famos_bus::PublishError::Invalid(e)) => Err(HandlerOutcome::reject(e)),
    }
}

//─────────────────────────────
//  Hippocampus group
//─────────────────────────────

/// Consumes accepted writes: persists the episode (authoritative write),
/// encodes hippocampal codes, projects CA1 triples, confirms with
/// `HIPPO_ENCODE`.
pub(crate) struct HippocampusHandler {
    pub hippo: Arc<Hippocampus>,
    pub episodes: EpisodeStore,
    pub engine: Arc<ConsolidationEngine>,
    pub bus: Arc<DurableBus>,
    pub people: BTreeSet<String>,
    pub device_id: String,
}

#[async_trait]
impl EventHandler for HippocampusHandler {
    async fn handle(&self, envelope: Envelope, _deadline: Duration) -> HandlerOutcome {
        let Ok(write) = envelope.payload_as::<WriteAccepted>() else {
            return HandlerOutcome::reject("not a WRITE_ACCEPTED payload");
        };
        let episode = famos_consolidation::Episode {
            event_id: envelope.id,
            space_id: envelope.space_id.clone(),
            ts: write.ts,
            text: write.text.clone(),
            author: envelope.actor.clone(),
            band: envelope.band,
            affect_confidence: 0.5,
        };
        if let Err(e) = self.episodes.put(&episode) {
            return HandlerOutcome::retry(e.to_string());
        }

        let outcome = match self
            .hippo
            .encode_event(
                &envelope.space_id,
                envelope.id,
                &write.text,
                write.ts,
                Some(envelope.event_type.as_str().to_string()),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return HandlerOutcome::retry(e.to_string()),
        };

        // CA1 bridge into the knowledge graph.
        for triple in famos_hippocampus::ca1::project_triples(
            &envelope.id,
            &write.text,
            write.ts,
            &self.people,
        ) {
            if let Err(e) = self.engine.kg().append(&triple) {
                return HandlerOutcome::retry(e.to_string());
            }
        }

        let payload = HippoEncode {
            event_id: write.event_id.clone(),
            simhash_bits: famos_hippocampus::SIMHASH_BITS,
            minhash_k: outcome.record.code.minhash.len(),
            novelty: outcome.novelty,
            near_duplicates: outcome
                .near_duplicates
                .iter()
                .map(|id| id.simple().to_string())
                .collect(),
            degraded: outcome.degraded,
        };
        let confirm = Envelope::builder(
            TOPIC_ENCODED,
            EventType::HippoEncode,
            envelope.space_id.clone(),
            envelope.actor.clone(),
            self.device_id.clone(),
        )
        .band(envelope.band)
        .idempotency_key(format!("hippo/{}", envelope.idempotency_key))
        .payload(&payload);
        let confirm = match confirm.and_then(|b| b.seal(Utc::now())) {
            Ok(env) => env,
            Err(e) => return HandlerOutcome::reject(e.to_string()),
        };
        if let Err(outcome) = publish_derived(&self.bus, confirm).await {
            return outcome;
        }
        HandlerOutcome::Ack
    }
}

//─────────────────────────────
//  Temporal group
//─────────────────────────────

/// Consumes accepted writes into the time shards, confirming with
/// `TEMPORAL_INDEX_BUILT`.
pub(crate) struct TemporalHandler {
    pub index: TemporalIndex,
    pub tz: Tz,
    pub bus: Arc<DurableBus>,
    pub device_id: String,
}

#[async_trait]
impl EventHandler for TemporalHandler {
    async fn handle(&self, envelope: Envelope, _deadline: Duration) -> HandlerOutcome {
        let Ok(write) = envelope.payload_as::<WriteAccepted>() else {
            return HandlerOutcome::reject("not a WRITE_ACCEPTED payload");
        };
        let buckets = match self
            .index
            .insert(&envelope.space_id, envelope.id, write.ts, self.tz)
        {
            Ok(buckets) => buckets,
            Err(e) => return HandlerOutcome::retry(e.to_string()),
        };
        let payload = TemporalIndexBuilt {
            event_id: write.event_id.clone(),
            buckets: buckets.to_vec(),
        };
        let confirm = Envelope::builder(
            TOPIC_TEMPORAL,
            EventType::TemporalIndexBuilt,
            envelope.space_id.clone(),
            envelope.actor.clone(),
            self.device_id.clone(),
        )
        .band(envelope.band)
        .idempotency_key(format!("temporal/{}", envelope.idempotency_key))
        .payload(&payload);
        let confirm = match confirm.and_then(|b| b.seal(Utc::now())) {
            Ok(env) => env,
            Err(e) => return HandlerOutcome::reject(e.to_string()),
        };
        if let Err(outcome) = publish_derived(&self.bus, confirm).await {
            return outcome;
        }
        HandlerOutcome::Ack
    }
}

//─────────────────────────────
//  Workspace group
//─────────────────────────────

/// Offers every accepted write to working memory.
pub(crate) struct WorkspaceHandler {
    pub workspace: Arc<Workspace>,
    pub half_life_hours: f64,
}

#[async_trait]
impl EventHandler for WorkspaceHandler {
    async fn handle(&self, envelope: Envelope, _deadline: Duration) -> HandlerOutcome {
        let Ok(write) = envelope.payload_as::<WriteAccepted>() else {
            return HandlerOutcome::reject("not a WRITE_ACCEPTED payload");
        };
        let now = Utc::now();
        let recency = famos_temporal::recency_score(write.ts, now, self.half_life_hours);
        let code = famos_hippocampus::DgEncoder::new(64).encode(&write.text);
        let summary: String = write.text.chars().take(80).collect();
        let candidate = Candidate {
            event_id: envelope.id,
            features: Features {
                recency,
                novelty: 0.5,
                ..Default::default()
            },
            summary,
            code: Some(code),
        };
        self.workspace
            .admit(&envelope.space_id, vec![candidate], now)
            .await;
        HandlerOutcome::Ack
    }
}

/// Publishes workspace snapshots as `WORKSPACE_BROADCAST` envelopes.
pub(crate) struct BusSink {
    pub bus: Arc<DurableBus>,
    pub device_id: String,
}

#[async_trait]
impl BroadcastSink for BusSink {
    async fn broadcast(&self, snapshot: WorkspaceBroadcast) -> anyhow::Result<()> {
        let space = snapshot.space_id.clone();
        let envelope = Envelope::builder(
            TOPIC_WORKSPACE,
            EventType::WorkspaceBroadcast,
            space.clone(),
            "workspace".to_string(),
            self.device_id.clone(),
        )
        .idempotency_key(format!(
            "ws/{}/{}",
            space.dir_name(),
            Utc::now().timestamp_micros()
        ))
        .payload(&snapshot)?
        .seal(Utc::now())?;
        self.bus.publish(envelope).await?;
        Ok(())
    }
}

//─────────────────────────────
//  Recall group
//─────────────────────────────

/// Answers `RECALL_QUERY` envelopes by fusing temporal ranges with CA3
/// completion. Failures surface as empty results, never as a wedged group.
pub(crate) struct RecallHandler {
    pub temporal: TemporalIndex,
    pub hippo: Arc<Hippocampus>,
    pub bus: Arc<DurableBus>,
    pub device_id: String,
    pub dayparts: famos_temporal::DaypartBounds,
}

impl RecallHandler {
    async fn answer(&self, envelope: &Envelope, query: &RecallQuery) -> RecallResult {
        let Ok(tz) = query.tz.parse::<Tz>() else {
            warn!(tz = %query.tz, "recall query with unknown timezone");
            return RecallResult {
                hits: vec![],
                degraded: false,
            };
        };

        let mut degraded = false;
        let mut hits: Vec<RecallHit> = Vec::new();

        let temporal_hits = match &query.phrase {
            Some(phrase) => {
                match parse_phrase(phrase, query.now, tz, &self.dayparts) {
                    Ok(ranges) => match self.temporal.range_query(
                        &envelope.space_id,
                        &ranges,
                        query.k.max(1) * 4,
                        query.now,
                        tz,
                    ) {
                        Ok(hits) => Some(hits),
                        Err(e) => {
                            warn!(error = %e, "temporal range query failed");
                            Some(vec![])
                        }
                    },
                    Err(e) => {
                        debug!(error = %e, "unparseable recall phrase");
                        Some(vec![])
                    }
                }
            }
            None => None,
        };

        let completions = match &query.cue {
            Some(cue) => match self.hippo.complete(&envelope.space_id, cue, query.k * 4).await {
                Ok((completions, was_degraded)) => {
                    degraded |= was_degraded;
                    Some(completions)
                }
                Err(e) => {
                    warn!(error = %e, "ca3 completion failed");
                    degraded = true;
                    Some(vec![])
                }
            },
            None => None,
        };

        match (temporal_hits, completions) {
            // Phrase only: recency-ordered temporal hits.
            (Some(temporal), None) => {
                for hit in temporal {
                    hits.push(RecallHit {
                        event_id: hit.event_id.simple().to_string(),
                        ts: hit.ts,
                        score: hit.recency,
                        recency: hit.recency,
                        reasons: vec![format!("time:recency={:.3}", hit.recency)],
                    });
                }
            }
            // Cue only: CA3 order, timestamps from the code store.
            (None, Some(completions)) => {
                for completion in completions {
                    let ts = self
                        .hippo
                        .store()
                        .get(&envelope.space_id, &completion.event_id)
                        .ok()
                        .flatten()
                        .map(|r| r.ts)
                        .unwrap_or(query.now);
                    hits.push(RecallHit {
                        event_id: completion.event_id.simple().to_string(),
                        ts,
                        score: completion.score,
                        recency: famos_temporal::recency_score(ts, query.now, 72.0),
                        reasons: completion.reasons,
                    });
                }
            }
            // Both: the phrase constrains, the cue re-ranks.
            (Some(temporal), Some(completions)) => {
                for hit in temporal {
                    let completion = completions.iter().find(|c| c.event_id == hit.event_id);
                    let (score, mut reasons) = match completion {
                        Some(c) => (
                            0.5 * hit.recency + 0.5 * c.score,
                            c.reasons.clone(),
                        ),
                        None => (0.5 * hit.recency, vec![]),
                    };
                    reasons.push(format!("time:recency={:.3}", hit.recency));
                    hits.push(RecallHit {
                        event_id: hit.event_id.simple().to_string(),
                        ts: hit.ts,
                        score,
                        recency: hit.recency,
                        reasons,
                    });
                }
                hits.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            (None, None) => {}
        }

        hits.truncate(query.k);
        RecallResult { hits, degraded }
    }
}

#[async_trait]
impl EventHandler for RecallHandler {
    async fn handle(&self, envelope: Envelope, _deadline: Duration) -> HandlerOutcome {
        if envelope.event_type != EventType::RecallQuery {
            // Results on the same topic are not ours to answer.
            return HandlerOutcome::Ack;
        }
        let Ok(query) = envelope.payload_as::<RecallQuery>() else {
            return HandlerOutcome::reject("not a RECALL_QUERY payload");
        };
        let result = self.answer(&envelope, &query).await;

        let correlation = envelope
            .correlation_id
            .clone()
            .unwrap_or_else(|| envelope.id.simple().to_string());
        let reply = Envelope::builder(
            crate::TOPIC_RECALL,
            EventType::RecallResult,
            envelope.space_id.clone(),
            envelope.actor.clone(),
            self.device_id.clone(),
        )
        .band(envelope.band)
        .correlation_id(correlation)
        .idempotency_key(format!("recall/{}", envelope.idempotency_key))
        .payload(&result);
        let reply = match reply.and_then(|b| b.seal(Utc::now())) {
            Ok(env) => env,
            Err(e) => return HandlerOutcome::reject(e.to_string()),
        };
        if let Err(outcome) = publish_derived(&self.bus, reply).await {
            return outcome;
        }
        HandlerOutcome::Ack
    }
}

//─────────────────────────────
//  Consolidation group
//─────────────────────────────

/// Runs consolidation passes on ticks and publishes `CONSOLIDATION_DONE`.
pub(crate) struct ConsolidationHandler {
    pub engine: Arc<ConsolidationEngine>,
    pub episodes: EpisodeStore,
    pub bus: Arc<DurableBus>,
    pub device_id: String,
}

#[async_trait]
impl EventHandler for ConsolidationHandler {
    async fn handle(&self, envelope: Envelope, _deadline: Duration) -> HandlerOutcome {
        if envelope.event_type != EventType::ConsolidationTick {
            return HandlerOutcome::Ack;
        }
        let Ok(tick) = envelope.payload_as::<ConsolidationTick>() else {
            return HandlerOutcome::reject("not a CONSOLIDATION_TICK payload");
        };

        let spaces: Vec<SpaceId> = self.episodes.spaces();
        let now = Utc::now();
        let mut done = ConsolidationDone {
            kind: tick.kind,
            groups_merged: 0,
            rollups_written: 0,
            triples_appended: 0,
        };
        for space in &spaces {
            match self.engine.run_pass(space, tick.kind, now, tick.budget_ms) {
                Ok(summary) => {
                    done.groups_merged += summary.groups_merged;
                    done.rollups_written += summary.rollups_written;
                    done.triples_appended += summary.triples_appended;
                }
                Err(e) => return HandlerOutcome::retry(e.to_string()),
            }
        }

        let confirm = Envelope::builder(
            TOPIC_CONSOLIDATION,
            EventType::ConsolidationDone,
            envelope.space_id.clone(),
            envelope.actor.clone(),
            self.device_id.clone(),
        )
        .idempotency_key(format!("consolidation/{}", envelope.idempotency_key))
        .payload(&done);
        let confirm = match confirm.and_then(|b| b.seal(Utc::now())) {
            Ok(env) => env,
            Err(e) => return HandlerOutcome::reject(e.to_string()),
        };
        if let Err(outcome) = publish_derived(&self.bus, confirm).await {
            return outcome;
        }
        HandlerOutcome::Ack
    }
}
