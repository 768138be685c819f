//! The episodic store: post-gate event texts, the single authoritative
//! write of the pipeline. Downstream indexes are derived from bus events.

use chrono::{DateTime, Utc};

use famos_consolidation::{Episode, EpisodeSource};
use famos_types::{EventId, SpaceId};

use crate::RuntimeError;

const SEP: u8 = 0x1f;

/// Sled-backed episode store keyed `space / ts / event_id`.
#[derive(Debug, Clone)]
pub struct EpisodeStore {
    tree: sled::Tree,
}

impl EpisodeStore {
    /// Open inside an existing sled database.
    pub fn open(db: &sled::Db) -> Result<Self, RuntimeError> {
        Ok(Self {
            tree: db
                .open_tree("episodes")
                .map_err(|e| RuntimeError::Store(e.to_string()))?,
        })
    }

    fn key(space: &SpaceId, ts: DateTime<Utc>, event_id: &EventId) -> Vec<u8> {
        let dir = space.dir_name();
        let mut key = Vec::with_capacity(dir.len() + 25);
        key.extend_from_slice(dir.as_bytes());
        key.push(SEP);
        key.extend_from_slice(&ts.timestamp_micros().to_be_bytes());
        key.extend_from_slice(event_id.as_bytes());
        key
    }

    /// Persist one episode. Idempotent per `(space, ts, event_id)`.
    pub fn put(&self, episode: &Episode) -> Result<(), RuntimeError> {
        let bytes =
            rmp_serde::to_vec(episode).map_err(|e| RuntimeError::Store(e.to_string()))?;
        self.tree
            .insert(
                Self::key(&episode.space_id, episode.ts, &episode.event_id),
                bytes,
            )
            .map_err(|e| RuntimeError::Store(e.to_string()))?;
        Ok(())
    }

    /// Spaces currently holding episodes.
    pub fn spaces(&self) -> Vec<SpaceId> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let Ok((key, _)) = entry else { continue };
            let Some(pos) = key.iter().position(|&b| b == SEP) else {
                continue;
            };
            let Ok(dir) = std::str::from_utf8(&key[..pos]) else {
                continue;
            };
            if let Some((kind, name)) = dir.split_once("__") {
                if let Ok(space) = SpaceId::parse(&format!("{kind}:{name}")) {
                    if !out.contains(&space) {
                        out.push(space);
                    }
                }
            }
        }
        out
    }
}

impl EpisodeSource for EpisodeStore {
    fn episodes_in(
        &self,
        space: &SpaceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Episode>> {
        let mut prefix = space.dir_name().into_bytes();
        prefix.push(SEP);
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(&prefix) {
            let (_, bytes) = entry?;
            let episode: Episode = rmp_serde::from_slice(&bytes)?;
            if episode.ts >= from && episode.ts < to {
                out.push(episode);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use famos_types::{Band, SpaceKind};
    use uuid::Uuid;

    fn episode(space: &SpaceId, text: &str) -> Episode {
        Episode {
            event_id: Uuid::new_v4(),
            space_id: space.clone(),
            ts: Utc::now(),
            text: text.into(),
            author: "alice".into(),
            band: Band::Green,
            affect_confidence: 0.5,
        }
    }

    #[test]
    fn put_scan_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let store = EpisodeStore::open(&db).unwrap();
        let shared = SpaceId::new(SpaceKind::Shared, "household").unwrap();
        let personal = SpaceId::new(SpaceKind::Personal, "alice").unwrap();
        store.put(&episode(&shared, "a")).unwrap();
        store.put(&episode(&shared, "b")).unwrap();
        store.put(&episode(&personal, "c")).unwrap();

        let from = Utc::now() - chrono::Duration::hours(1);
        let to = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(store.episodes_in(&shared, from, to).unwrap().len(), 2);
        assert_eq!(store.episodes_in(&personal, from, to).unwrap().len(), 1);
        assert_eq!(store.spaces().len(), 2);
    }
}
