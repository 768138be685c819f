//! Durable consumer-group offset state.
//!
//! One small file per `(group, topic)` under `offsets/`, rewritten whole via
//! write-temp-then-rename so a crash can never leave a half-written state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::BusError;

/// A delivery currently handed to a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlight {
    /// Record offset being processed.
    pub offset: u64,
    /// 1-based delivery attempt.
    pub attempt: u32,
    /// Redelivery becomes eligible once this passes.
    pub deadline: DateTime<Utc>,
}

/// Persistent state of one `(group, topic)` subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupOffsets {
    /// Highest committed offset; `None` for a group that never acked.
    pub committed: Option<u64>,
    /// Bounded list of in-flight deliveries with deadlines.
    pub in_flight: Vec<InFlight>,
}

impl GroupOffsets {
    /// First offset that still needs delivery.
    pub fn next(&self) -> u64 {
        self.committed.map(|c| c + 1).unwrap_or(0)
    }

    /// Advance the committed offset; idempotent and monotonic.
    pub fn commit(&mut self, offset: u64) {
        if self.committed.map(|c| offset > c).unwrap_or(true) {
            self.committed = Some(offset);
        }
        let committed = self.committed;
        self.in_flight
            .retain(|f| committed.map(|c| f.offset > c).unwrap_or(true));
    }
}

/// Loads and atomically persists [`GroupOffsets`] files.
#[derive(Debug)]
pub(crate) struct OffsetStore {
    dir: PathBuf,
}

impl OffsetStore {
    pub(crate) fn new(bus_root: &Path) -> Result<Self, BusError> {
        let dir = bus_root.join("offsets");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, group: &str, topic: &str) -> PathBuf {
        self.dir.join(format!("{group}__{topic}"))
    }

    /// Load state for a `(group, topic)`, defaulting to empty for new groups.
    pub(crate) fn load(&self, group: &str, topic: &str) -> Result<GroupOffsets, BusError> {
        let path = self.path(group, topic);
        match std::fs::read(&path) {
            Ok(bytes) => {
                rmp_serde::from_slice(&bytes).map_err(|e| BusError::Codec(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GroupOffsets::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist state atomically (temp file + rename + dir-agnostic fsync).
    pub(crate) fn store(
        &self,
        group: &str,
        topic: &str,
        offsets: &GroupOffsets,
    ) -> Result<(), BusError> {
        let bytes = rmp_serde::to_vec(offsets).map_err(|e| BusError::Codec(e.to_string()))?;
        let final_path = self.path(group, topic);
        let tmp_path = self.dir.join(format!(".{group}__{topic}.tmp"));
        {
            use std::io::Write;
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_data()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_is_monotonic_and_idempotent() {
        let mut g = GroupOffsets::default();
        assert_eq!(g.next(), 0);
        g.commit(3);
        g.commit(1);
        g.commit(3);
        assert_eq!(g.committed, Some(3));
        assert_eq!(g.next(), 4);
    }

    #[test]
    fn commit_clears_covered_in_flight() {
        let mut g = GroupOffsets::default();
        g.in_flight.push(InFlight {
            offset: 2,
            attempt: 1,
            deadline: Utc::now(),
        });
        g.in_flight.push(InFlight {
            offset: 5,
            attempt: 1,
            deadline: Utc::now(),
        });
        g.commit(3);
        assert_eq!(g.in_flight.len(), 1);
        assert_eq!(g.in_flight[0].offset, 5);
    }

    #[test]
    fn store_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = OffsetStore::new(dir.path()).unwrap();
        let mut g = GroupOffsets::default();
        g.commit(7);
        store.store("hippo", "memory.write", &g).unwrap();
        let loaded = store.load("hippo", "memory.write").unwrap();
        assert_eq!(loaded, g);
        // Unknown pairs come back empty.
        let fresh = store.load("nobody", "memory.write").unwrap();
        assert_eq!(fresh, GroupOffsets::default());
    }
}
