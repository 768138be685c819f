//! Prospective memory: triggers that fire future actions.
//!
//! Schedules are tz-owned: a `daily_time` trigger carries its own IANA zone
//! and fires at that wall-clock time no matter which device evaluates it.
//! Missed slots are never backfilled; after downtime only the next future
//! slot fires.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use famos_bus::DurableBus;
use famos_policy::{gate, PolicyEngine, RequestContext};
use famos_types::payload::{GatingContext, TriggerFired, TriggerSkipped};
use famos_types::{Band, Envelope, EventType, SpaceId};

use crate::WorkflowError;

/// Topic prospective lifecycle events are published on.
pub const PROSPECTIVE_TOPIC: &str = "prospective";

/// Eligibility threshold below which a due slot is skipped.
pub const ELIGIBILITY_THRESHOLD: f64 = 0.6;

//─────────────────────────────
//  Schedules
//─────────────────────────────

/// When a trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire once at an absolute instant.
    Once {
        /// The instant.
        fire_at: DateTime<Utc>,
    },
    /// Fixed-period repetition.
    Interval {
        /// Period in seconds.
        every_seconds: u64,
        /// Anchor; trigger creation time when absent.
        start_at: Option<DateTime<Utc>>,
        /// No fires at or after this instant.
        end_at: Option<DateTime<Utc>>,
        /// Total fire cap.
        max_fires: Option<u32>,
    },
    /// Same wall-clock time on selected weekdays, in the schedule's own zone.
    DailyTime {
        /// Hour 0–23.
        hour: u32,
        /// Minute 0–59.
        minute: u32,
        /// Allowed weekdays, 0 = Monday … 6 = Sunday.
        days_of_week: Vec<u8>,
        /// IANA zone the wall-clock time is anchored to.
        tz: String,
    },
}

impl Schedule {
    /// Next fire instant strictly after `now`, given `fires` already done.
    /// `None` means the schedule is exhausted.
    pub fn next_after(
        &self,
        now: DateTime<Utc>,
        created_at: DateTime<Utc>,
        fires: u32,
    ) -> Result<Option<DateTime<Utc>>, WorkflowError> {
        match self {
            Schedule::Once { fire_at } => Ok(if *fire_at > now && fires == 0 {
                Some(*fire_at)
            } else {
                None
            }),
            Schedule::Interval {
                every_seconds,
                start_at,
                end_at,
                max_fires,
            } => {
                if max_fires.map(|m| fires >= m).unwrap_or(false) {
                    return Ok(None);
                }
                let period = Duration::seconds((*every_seconds).max(1) as i64);
                let anchor = start_at.unwrap_or(created_at);
                let mut next = if now < anchor {
                    anchor
                } else {
                    // Only the next future slot; offline gaps are skipped.
                    let elapsed = (now - anchor).num_seconds();
                    let periods = elapsed / period.num_seconds() + 1;
                    anchor + period * periods as i32
                };
                if next <= now {
                    next += period;
                }
                if end_at.map(|end| next >= end).unwrap_or(false) {
                    return Ok(None);
                }
                Ok(Some(next))
            }
            Schedule::DailyTime {
                hour,
                minute,
                days_of_week,
                tz,
            } => {
                let tz: Tz = tz
                    .parse()
                    .map_err(|_| WorkflowError::Codec(format!("unknown timezone {tz}")))?;
                let time = NaiveTime::from_hms_opt(*hour, *minute, 0)
                    .ok_or_else(|| WorkflowError::Codec(format!("bad time {hour}:{minute}")))?;
                let local_now = now.with_timezone(&tz);
                let mut date = local_now.date_naive();
                for _ in 0..8 {
                    let weekday = date.weekday().num_days_from_monday() as u8;
                    if days_of_week.is_empty() || days_of_week.contains(&weekday) {
                        let candidate = match tz.from_local_datetime(&date.and_time(time)) {
                            chrono::LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
                            chrono::LocalResult::Ambiguous(earliest, _) => {
                                Some(earliest.with_timezone(&Utc))
                            }
                            chrono::LocalResult::None => None,
                        };
                        if let Some(candidate) = candidate {
                            if candidate > now {
                                return Ok(Some(candidate));
                            }
                        }
                    }
                    date += Duration::days(1);
                }
                Ok(None)
            }
        }
    }
}

//─────────────────────────────
//  Triggers
//─────────────────────────────

/// Trigger lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerStatus {
    /// Defined but not armed.
    Draft,
    /// Armed.
    Active,
    /// Suppressed until `snoozed_until`.
    Snoozed,
    /// Cancelled by a user.
    Cancelled,
    /// Schedule exhausted.
    Expired,
}

/// The action envelope a firing trigger produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    /// Destination topic.
    pub topic: String,
    /// Catalog type.
    pub event_type: EventType,
    /// Sensitivity band.
    pub band: Band,
    /// Payload value.
    pub payload: serde_json::Value,
}

/// A prospective trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Trigger id.
    pub id: String,
    /// Owning space.
    pub space_id: SpaceId,
    /// Acting family member.
    pub actor: String,
    /// Producing device.
    pub device: String,
    /// When to fire.
    pub schedule: Schedule,
    /// What to emit on fire.
    pub action: ActionTemplate,
    /// Lifecycle state.
    pub status: TriggerStatus,
    /// Next due instant, `None` when exhausted.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Fires so far.
    pub fires: u32,
    /// Suppression end for `Snoozed`.
    pub snoozed_until: Option<DateTime<Utc>>,
    /// Creation instant (interval anchor fallback).
    pub created_at: DateTime<Utc>,
}

/// Fitness-to-fire given the current affect/safety context.
///
/// `clamp(1 − 0.5·arousal − 0.4·safety_pressure, 0, 1)`
pub fn eligibility(gating: &GatingContext) -> f64 {
    (1.0 - 0.5 * gating.arousal - 0.4 * gating.safety_pressure).clamp(0.0, 1.0)
}

//─────────────────────────────
//  Scheduler
//─────────────────────────────

/// Durable prospective scheduler. Triggers persist as JSON files under
/// `triggers/`; `poll` is driven by the runtime's clock tick.
pub struct ProspectiveScheduler {
    dir: PathBuf,
    triggers: DashMap<String, Trigger>,
    bus: Arc<DurableBus>,
    policy: Arc<dyn PolicyEngine>,
}

impl ProspectiveScheduler {
    /// Open the scheduler, loading any persisted triggers.
    pub fn open(
        root: impl Into<PathBuf>,
        bus: Arc<DurableBus>,
        policy: Arc<dyn PolicyEngine>,
    ) -> Result<Self, WorkflowError> {
        let dir = root.into().join("triggers");
        std::fs::create_dir_all(&dir)?;
        let triggers = DashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let bytes = std::fs::read(&path)?;
                match serde_json::from_slice::<Trigger>(&bytes) {
                    Ok(trigger) => {
                        triggers.insert(trigger.id.clone(), trigger);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping bad trigger file"),
                }
            }
        }
        info!(count = triggers.len(), "prospective scheduler loaded");
        Ok(Self {
            dir,
            triggers,
            bus,
            policy,
        })
    }

    fn persist(&self, trigger: &Trigger) -> Result<(), WorkflowError> {
        let path = self.dir.join(format!("{}.json", trigger.id));
        let tmp = path.with_extension("tmp");
        let bytes =
            serde_json::to_vec_pretty(trigger).map_err(|e| WorkflowError::Codec(e.to_string()))?;
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Create or update a trigger; arms it and computes `next_fire_at`.
    pub async fn upsert(
        &self,
        mut trigger: Trigger,
        now: DateTime<Utc>,
        ctx: &RequestContext,
    ) -> Result<(), WorkflowError> {
        trigger.next_fire_at = trigger
            .schedule
            .next_after(now, trigger.created_at, trigger.fires)?;
        if trigger.status == TriggerStatus::Draft {
            trigger.status = TriggerStatus::Active;
        }
        if trigger.next_fire_at.is_none() {
            trigger.status = TriggerStatus::Expired;
        }
        self.persist(&trigger)?;
        self.publish_lifecycle(
            &trigger,
            EventType::ProsTriggerUpsert,
            serde_json::json!({ "trigger_id": trigger.id, "next_fire_at": trigger.next_fire_at }),
            ctx,
        )
        .await?;
        self.triggers.insert(trigger.id.clone(), trigger);
        Ok(())
    }

    /// Snooze an active trigger until `until`.
    pub async fn snooze(
        &self,
        trigger_id: &str,
        until: DateTime<Utc>,
        ctx: &RequestContext,
    ) -> Result<(), WorkflowError> {
        let snapshot = {
            let mut entry = self
                .triggers
                .get_mut(trigger_id)
                .ok_or_else(|| WorkflowError::UnknownSpec(trigger_id.to_string()))?;
            entry.status = TriggerStatus::Snoozed;
            entry.snoozed_until = Some(until);
            entry.clone()
        };
        self.persist(&snapshot)?;
        self.publish_lifecycle(
            &snapshot,
            EventType::ProsTriggerSnoozed,
            serde_json::json!({ "trigger_id": trigger_id, "until": until }),
            ctx,
        )
        .await
    }

    /// Cancel a trigger.
    pub async fn cancel(&self, trigger_id: &str, ctx: &RequestContext) -> Result<(), WorkflowError> {
        let snapshot = {
            let mut entry = self
                .triggers
                .get_mut(trigger_id)
                .ok_or_else(|| WorkflowError::UnknownSpec(trigger_id.to_string()))?;
            entry.status = TriggerStatus::Cancelled;
            entry.next_fire_at = None;
            entry.clone()
        };
        self.persist(&snapshot)?;
        self.publish_lifecycle(
            &snapshot,
            EventType::ProsTriggerCancelled,
            serde_json::json!({ "trigger_id": trigger_id }),
            ctx,
        )
        .await
    }

    /// Evaluate every due trigger at `now` under the gating context.
    /// Returns how many triggers fired.
    pub async fn poll(
        &self,
        now: DateTime<Utc>,
        gating: &GatingContext,
        ctx: &RequestContext,
    ) -> Result<usize, WorkflowError> {
        let due: Vec<Trigger> = self
            .triggers
            .iter()
            .filter(|t| t.next_fire_at.map(|at| at <= now).unwrap_or(false))
            .map(|t| t.value().clone())
            .collect();

        let mut fired = 0;
        for mut trigger in due {
            // Snoozes wake themselves up when their window passes.
            if trigger.status == TriggerStatus::Snoozed {
                match trigger.snoozed_until {
                    Some(until) if until > now => {
                        continue;
                    }
                    _ => {
                        trigger.status = TriggerStatus::Active;
                        trigger.snoozed_until = None;
                    }
                }
            }
            if trigger.status != TriggerStatus::Active {
                continue;
            }

            let score = eligibility(gating);
            let next = trigger.schedule.next_after(now, trigger.created_at, trigger.fires + 1)?;
            if score >= ELIGIBILITY_THRESHOLD {
                self.fire(&mut trigger, now, score, next, ctx).await?;
                fired += 1;
            } else {
                let reason = if gating.arousal > 0.7 {
                    "arousal_too_high"
                } else if gating.safety_pressure > 0.7 {
                    "safety_pressure_high"
                } else {
                    "eligibility_below_threshold"
                };
                debug!(trigger = %trigger.id, score, reason, "trigger skipped");
                // A skipped slot is consumed; no backfill.
                let next =
                    trigger.schedule.next_after(now, trigger.created_at, trigger.fires)?;
                trigger.next_fire_at = next;
                if next.is_none() {
                    trigger.status = TriggerStatus::Expired;
                }
                let payload = TriggerSkipped {
                    trigger_id: trigger.id.clone(),
                    reason: reason.to_string(),
                    eligibility: score,
                    next_fire_at: next,
                };
                self.publish_lifecycle(
                    &trigger,
                    EventType::ProsTriggerSkipped,
                    serde_json::to_value(&payload)
                        .map_err(|e| WorkflowError::Codec(e.to_string()))?,
                    ctx,
                )
                .await?;
                self.persist(&trigger)?;
                self.triggers.insert(trigger.id.clone(), trigger);
            }
        }
        Ok(fired)
    }

    async fn fire(
        &self,
        trigger: &mut Trigger,
        now: DateTime<Utc>,
        score: f64,
        next: Option<DateTime<Utc>>,
        ctx: &RequestContext,
    ) -> Result<(), WorkflowError> {
        info!(trigger = %trigger.id, eligibility = score, "trigger fired");

        // The action envelope itself, deduped per slot.
        let slot_key = format!("pros/{}/{}", trigger.id, now.timestamp());
        let action = Envelope::builder(
            trigger.action.topic.clone(),
            trigger.action.event_type,
            trigger.space_id.clone(),
            trigger.actor.clone(),
            trigger.device.clone(),
        )
        .band(trigger.action.band)
        .idempotency_key(slot_key)
        .payload(&trigger.action.payload)
        .map_err(|e| WorkflowError::Codec(e.to_string()))?
        .seal(now)
        .map_err(|e| WorkflowError::Codec(e.to_string()))?;
        let action = gate(self.policy.as_ref(), action, ctx)?;
        self.bus
            .publish(action)
            .await
            .map_err(|e| WorkflowError::Publish(e.to_string()))?;

        trigger.fires += 1;
        trigger.next_fire_at = next;
        if next.is_none() {
            trigger.status = TriggerStatus::Expired;
        }
        let payload = TriggerFired {
            trigger_id: trigger.id.clone(),
            eligibility: score,
            next_fire_at: next,
        };
        self.publish_lifecycle(
            trigger,
            EventType::ProsTriggerFired,
            serde_json::to_value(&payload).map_err(|e| WorkflowError::Codec(e.to_string()))?,
            ctx,
        )
        .await?;
        self.persist(trigger)?;
        self.triggers.insert(trigger.id.clone(), trigger.clone());
        Ok(())
    }

    async fn publish_lifecycle(
        &self,
        trigger: &Trigger,
        event_type: EventType,
        payload: serde_json::Value,
        ctx: &RequestContext,
    ) -> Result<(), WorkflowError> {
        let key = format!(
            "pros-life/{}/{}/{}",
            trigger.id,
            event_type.as_str(),
            Utc::now().timestamp_micros()
        );
        let envelope = Envelope::builder(
            PROSPECTIVE_TOPIC,
            event_type,
            trigger.space_id.clone(),
            trigger.actor.clone(),
            trigger.device.clone(),
        )
        .idempotency_key(key)
        .payload(&payload)
        .map_err(|e| WorkflowError::Codec(e.to_string()))?
        .seal(Utc::now())
        .map_err(|e| WorkflowError::Codec(e.to_string()))?;
        let envelope = gate(self.policy.as_ref(), envelope, ctx)?;
        self.bus
            .publish(envelope)
            .await
            .map_err(|e| WorkflowError::Publish(e.to_string()))?;
        Ok(())
    }
}
