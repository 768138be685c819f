//! Append-only, space-scoped store of hippocampal codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use famos_types::{EventId, SpaceId};

use crate::dg::SparseCode;
use crate::HippoError;

const SEP: u8 = 0x1f;

/// One stored code. Codes are append-only; DSAR deletion tombstones the
/// record and relinks duplicates to the surviving canonical id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRecord {
    /// Encoded event.
    pub event_id: EventId,
    /// Owning space.
    pub space_id: SpaceId,
    /// DG sparse code.
    pub code: SparseCode,
    /// Event timestamp.
    pub ts: DateTime<Utc>,
    /// Free-form hint carried alongside the code (never raw content for
    /// AMBER+ material).
    pub meta_hint: Option<String>,
    /// Set when the record was tombstoned; `canonical` points at the
    /// surviving duplicate when one exists.
    pub tombstoned: bool,
    /// Canonical event this record was merged into, if any.
    pub canonical: Option<EventId>,
}

/// Sled-backed code store (`hippocampus/codes.kv` in the storage layout).
#[derive(Debug, Clone)]
pub struct CodeStore {
    tree: sled::Tree,
}

impl CodeStore {
    /// Open the store inside an existing sled database.
    pub fn open(db: &sled::Db) -> Result<Self, HippoError> {
        Ok(Self {
            tree: db.open_tree("hippo_codes")?,
        })
    }

    fn key(space: &SpaceId, event_id: &EventId) -> Vec<u8> {
        let dir = space.dir_name();
        let mut key = Vec::with_capacity(dir.len() + 17);
        key.extend_from_slice(dir.as_bytes());
        key.push(SEP);
        key.extend_from_slice(event_id.as_bytes());
        key
    }

    /// Insert a record. Idempotent by `(space, event_id)`.
    pub fn put(&self, record: &CodeRecord) -> Result<(), HippoError> {
        let bytes = rmp_serde::to_vec(record).map_err(|e| HippoError::Codec(e.to_string()))?;
        self.tree
            .insert(Self::key(&record.space_id, &record.event_id), bytes)?;
        Ok(())
    }

    /// Fetch one record.
    pub fn get(&self, space: &SpaceId, event_id: &EventId) -> Result<Option<CodeRecord>, HippoError> {
        match self.tree.get(Self::key(space, event_id))? {
            Some(bytes) => Ok(Some(
                rmp_serde::from_slice(&bytes).map_err(|e| HippoError::Codec(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// All live (non-tombstoned) records in a space.
    pub fn live_in_space(&self, space: &SpaceId) -> Result<Vec<CodeRecord>, HippoError> {
        let mut prefix = space.dir_name().into_bytes();
        prefix.push(SEP);
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(&prefix) {
            let (_, bytes) = entry?;
            let record: CodeRecord =
                rmp_serde::from_slice(&bytes).map_err(|e| HippoError::Codec(e.to_string()))?;
            if !record.tombstoned {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Tombstone a record, optionally relinking it to a canonical duplicate.
    pub fn tombstone(
        &self,
        space: &SpaceId,
        event_id: &EventId,
        canonical: Option<EventId>,
    ) -> Result<bool, HippoError> {
        match self.get(space, event_id)? {
            Some(mut record) => {
                record.tombstoned = true;
                record.canonical = canonical;
                self.put(&record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Helper constructing a fresh live record.
pub(crate) fn new_record(
    event_id: Uuid,
    space_id: SpaceId,
    code: SparseCode,
    ts: DateTime<Utc>,
    meta_hint: Option<String>,
) -> CodeRecord {
    CodeRecord {
        event_id,
        space_id,
        code,
        ts,
        meta_hint,
        tombstoned: false,
        canonical: None,
    }
}
