//! Monotone producer clock.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Hands out strictly increasing UTC instants for a single producer.
///
/// Wall clocks can step backwards (NTP, suspend/resume); envelope invariants
/// require `ts` to be monotone per producer, so the clock never returns a
/// value at or before the last one it handed out.
#[derive(Debug)]
pub struct ProducerClock {
    last_micros: Mutex<i64>,
}

impl Default for ProducerClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProducerClock {
    /// Create a clock with no history.
    pub fn new() -> Self {
        Self {
            last_micros: Mutex::new(i64::MIN),
        }
    }

    /// Next instant: wall time, bumped by one microsecond past the previous
    /// value when the wall clock has not advanced.
    pub fn now(&self) -> DateTime<Utc> {
        self.at(Utc::now())
    }

    /// Like [`ProducerClock::now`] but with an injected wall reading, for tests.
    pub fn at(&self, wall: DateTime<Utc>) -> DateTime<Utc> {
        let wall_micros = wall.timestamp_micros();
        let mut last = self
            .last_micros
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = wall_micros.max(*last + 1);
        *last = next;
        DateTime::from_timestamp_micros(next).unwrap_or(wall)
    }
}
