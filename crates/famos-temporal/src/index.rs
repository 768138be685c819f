//! Sled-backed multi-resolution time shards.
//!
//! One tree per resolution. Keys are
//! `space \x1f bucket \x1f ts_be(8) event_id(16)` so a prefix scan over
//! `(space, bucket)` yields events in timestamp order with no value decoding.

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

use famos_types::{EventId, SpaceId};

use crate::timelex::UtcRange;
use crate::{recency_score, CircadianFeatures, Resolution, TemporalConfig, TemporalError};

const SEP: u8 = 0x1f;

/// One scored hit from a range query.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalHit {
    /// Matched event.
    pub event_id: EventId,
    /// Event timestamp.
    pub ts: DateTime<Utc>,
    /// `2^(-Δt_hours / h)` against the query's `now`.
    pub recency: f64,
    /// Circadian features of the event instant in the caller's timezone.
    pub features: CircadianFeatures,
}

/// The temporal index service. Cheap to clone; sled trees are shared.
#[derive(Debug, Clone)]
pub struct TemporalIndex {
    trees: [sled::Tree; 4],
    config: TemporalConfig,
}

impl TemporalIndex {
    /// Open the index inside an existing sled database.
    pub fn open(db: &sled::Db, config: TemporalConfig) -> Result<Self, TemporalError> {
        let mut trees = Vec::with_capacity(4);
        for resolution in Resolution::ALL {
            trees.push(db.open_tree(format!("temporal_{}", resolution.tree_name()))?);
        }
        let trees: [sled::Tree; 4] = trees
            .try_into()
            .expect("exactly four resolutions");
        Ok(Self { trees, config })
    }

    /// Bucket keys covering `ts` in the producing device's local calendar,
    /// in [`Resolution::ALL`] order.
    pub fn buckets_for(ts: DateTime<Utc>, tz: Tz) -> [String; 4] {
        let local = ts.with_timezone(&tz);
        let iso = local.iso_week();
        [
            format!(
                "{:04}-{:02}-{:02}-{:02}",
                local.year(),
                local.month(),
                local.day(),
                local.hour()
            ),
            format!("{:04}-{:02}-{:02}", local.year(), local.month(), local.day()),
            format!("{:04}-W{:02}", iso.year(), iso.week()),
            format!("{:04}-{:02}", local.year(), local.month()),
        ]
    }

    /// Insert an event into every covering shard. Idempotent: re-inserting
    /// the same `(event, ts)` overwrites the same keys.
    pub fn insert(
        &self,
        space: &SpaceId,
        event_id: EventId,
        ts: DateTime<Utc>,
        tz: Tz,
    ) -> Result<[String; 4], TemporalError> {
        let buckets = Self::buckets_for(ts, tz);
        for (tree, bucket) in self.trees.iter().zip(buckets.iter()) {
            tree.insert(shard_key(space, bucket, ts, &event_id), &[])?;
        }
        tracing::debug!(space = %space, event = %event_id, ?buckets, "temporal insert");
        Ok(buckets)
    }

    /// Remove an event from every covering shard (tombstoning support).
    pub fn remove(
        &self,
        space: &SpaceId,
        event_id: EventId,
        ts: DateTime<Utc>,
        tz: Tz,
    ) -> Result<(), TemporalError> {
        let buckets = Self::buckets_for(ts, tz);
        for (tree, bucket) in self.trees.iter().zip(buckets.iter()) {
            tree.remove(shard_key(space, bucket, ts, &event_id))?;
        }
        Ok(())
    }

    /// Query events inside any of `ranges`, newest-scored first, limited to
    /// `k`. Day shards covering each range (±1 day of timezone slack) are
    /// scanned and every hit filtered by exact timestamp containment.
    pub fn range_query(
        &self,
        space: &SpaceId,
        ranges: &[UtcRange],
        k: usize,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<Vec<TemporalHit>, TemporalError> {
        let day_tree = &self.trees[1];
        let mut hits: Vec<TemporalHit> = Vec::new();
        for range in ranges {
            let mut date = (range.start - chrono::Duration::days(1)).date_naive();
            let last = (range.end + chrono::Duration::days(1)).date_naive();
            while date <= last {
                let bucket = format!("{:04}-{:02}-{:02}", date.year(), date.month(), date.day());
                let prefix = shard_prefix(space, &bucket);
                for entry in day_tree.scan_prefix(&prefix) {
                    let (key, _) = entry?;
                    if let Some((ts, event_id)) = decode_tail(&key, prefix.len()) {
                        if range.contains(ts) && !hits.iter().any(|h| h.event_id == event_id) {
                            hits.push(self.hit(event_id, ts, now, tz));
                        }
                    }
                }
                date += chrono::Duration::days(1);
            }
        }
        hits.sort_by(|a, b| {
            b.recency
                .partial_cmp(&a.recency)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn hit(&self, event_id: EventId, ts: DateTime<Utc>, now: DateTime<Utc>, tz: Tz) -> TemporalHit {
        TemporalHit {
            event_id,
            ts,
            recency: recency_score(ts, now, self.config.half_life_hours),
            features: circadian(ts, tz),
        }
    }

    /// Configured daypart bounds, shared with the phrase parser.
    pub fn config(&self) -> &TemporalConfig {
        &self.config
    }
}

/// Circadian features of `ts` viewed in `tz`.
pub fn circadian(ts: DateTime<Utc>, tz: Tz) -> CircadianFeatures {
    use std::f64::consts::TAU;
    let local = ts.with_timezone(&tz);
    let hod = local.hour() as f64 + local.minute() as f64 / 60.0;
    let dow = local.weekday().num_days_from_monday() as f64;
    CircadianFeatures {
        sin_hod: (TAU * hod / 24.0).sin(),
        cos_hod: (TAU * hod / 24.0).cos(),
        sin_dow: (TAU * dow / 7.0).sin(),
        cos_dow: (TAU * dow / 7.0).cos(),
        is_weekend: if dow >= 5.0 { 1.0 } else { 0.0 },
    }
}

fn shard_prefix(space: &SpaceId, bucket: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(space.dir_name().len() + bucket.len() + 2);
    key.extend_from_slice(space.dir_name().as_bytes());
    key.push(SEP);
    key.extend_from_slice(bucket.as_bytes());
    key.push(SEP);
    key
}

fn shard_key(space: &SpaceId, bucket: &str, ts: DateTime<Utc>, event_id: &EventId) -> Vec<u8> {
    let mut key = shard_prefix(space, bucket);
    key.extend_from_slice(&ts.timestamp_micros().to_be_bytes());
    key.extend_from_slice(event_id.as_bytes());
    key
}

fn decode_tail(key: &[u8], prefix_len: usize) -> Option<(DateTime<Utc>, EventId)> {
    let tail = key.get(prefix_len..)?;
    if tail.len() != 8 + 16 {
        return None;
    }
    let micros = i64::from_be_bytes(tail[..8].try_into().ok()?);
    let ts = DateTime::from_timestamp_micros(micros)?;
    let event_id = Uuid::from_slice(&tail[8..]).ok()?;
    Some((ts, event_id))
}
