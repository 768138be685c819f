#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **famos-temporal** – Time shards and relative-phrase recall for FamilyOS.
//!
//! Every accepted write is inserted into one shard per resolution (hour,
//! local calendar day, ISO week, month). Recall parses relative phrases like
//! `"yesterday morning"` into UTC ranges anchored to the caller's timezone,
//! then scans the covering shards, scoring hits by exponential recency and
//! attaching a circadian feature vector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod index;
pub mod timelex;

pub use index::{circadian, TemporalHit, TemporalIndex};
pub use timelex::{parse_phrase, Daypart, DaypartBounds, UtcRange};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Temporal index tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalConfig {
    /// Recency half-life in hours: `recency = 2^(-Δt_hours / h)`.
    pub half_life_hours: f64,
    /// Local-time daypart boundaries used by the phrase parser.
    pub dayparts: DaypartBounds,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            half_life_hours: 72.0,
            dayparts: DaypartBounds::default(),
        }
    }
}

//─────────────────────────────
//  Resolutions
//─────────────────────────────

/// Shard resolutions, coarsest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// One UTC-hour bucket (`2025-09-06-12`).
    Hour,
    /// One local calendar day (`2025-09-06`).
    Day,
    /// One ISO week (`2025-W36`).
    IsoWeek,
    /// One calendar month (`2025-09`).
    Month,
}

impl Resolution {
    /// All resolutions in insert order.
    pub const ALL: [Resolution; 4] = [
        Resolution::Hour,
        Resolution::Day,
        Resolution::IsoWeek,
        Resolution::Month,
    ];

    /// Sled tree name for this resolution.
    pub fn tree_name(&self) -> &'static str {
        match self {
            Resolution::Hour => "hour",
            Resolution::Day => "day",
            Resolution::IsoWeek => "iso_week",
            Resolution::Month => "month",
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Temporal index failures.
#[derive(Debug, thiserror::Error)]
pub enum TemporalError {
    /// Underlying sled failure.
    #[error("temporal store error: {0}")]
    Store(#[from] sled::Error),
    /// Unknown IANA timezone name.
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    /// Phrase the lexer does not understand.
    #[error("unrecognized time phrase: {0:?}")]
    UnrecognizedPhrase(String),
}

/// Circadian feature vector for a local instant:
/// `(sin HOD, cos HOD, sin DOW, cos DOW, is_weekend)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircadianFeatures {
    /// `sin(2π · hour_of_day / 24)`.
    pub sin_hod: f64,
    /// `cos(2π · hour_of_day / 24)`.
    pub cos_hod: f64,
    /// `sin(2π · day_of_week / 7)`.
    pub sin_dow: f64,
    /// `cos(2π · day_of_week / 7)`.
    pub cos_dow: f64,
    /// 1.0 on Saturday/Sunday, else 0.0.
    pub is_weekend: f64,
}

/// Exponential recency score `2^(-Δt_hours / half_life)`, clamped so events
/// "from the future" (clock skew) score 1.
pub fn recency_score(ts: DateTime<Utc>, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
    let dt_hours = (now - ts).num_milliseconds() as f64 / 3_600_000.0;
    if dt_hours <= 0.0 {
        return 1.0;
    }
    (2f64).powf(-dt_hours / half_life_hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn recency_matches_reference_value() {
        // Δt = 27.5h at h = 72 ⇒ 2^(-27.5/72) ≈ 0.766.
        let ts = Utc.with_ymd_and_hms(2025, 9, 5, 6, 30, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 9, 6, 10, 0, 0).unwrap();
        let r = recency_score(ts, now, 72.0);
        assert!((r - 0.766).abs() < 0.005, "got {r}");
    }

    #[test]
    fn future_events_clamp_to_one() {
        let now = Utc::now();
        assert_eq!(recency_score(now + chrono::Duration::hours(1), now, 72.0), 1.0);
    }
}
