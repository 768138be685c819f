//! CRDT operations and their content-derived ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use famos_types::SpaceId;

/// Content hash identifying one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub [u8; 32]);

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// One operation in a space DAG.
///
/// `op_id = blake3(author, lamport, ts, kind, payload)`, so identical
/// content from the same author at the same clock collapses to one op and
/// replication is idempotent by construction. Parents are the author's view
/// of the heads at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    /// Content-derived id.
    pub op_id: OpId,
    /// Authoring device.
    pub author_id: String,
    /// Lamport clock value.
    pub lamport: u64,
    /// Author wall-clock timestamp.
    pub ts: DateTime<Utc>,
    /// Parent op ids (the heads the author knew).
    pub parents: SmallVec<[OpId; 4]>,
    /// Operation kind, e.g. `envelope.append`, `tombstone`.
    pub kind: String,
    /// Operation payload.
    pub payload: serde_json::Value,
    /// Owning space.
    pub space_id: SpaceId,
}

impl Op {
    /// Build an op, deriving its id from the identity-bearing fields.
    pub fn new(
        author_id: impl Into<String>,
        lamport: u64,
        ts: DateTime<Utc>,
        parents: SmallVec<[OpId; 4]>,
        kind: impl Into<String>,
        payload: serde_json::Value,
        space_id: SpaceId,
    ) -> Self {
        let author_id = author_id.into();
        let kind = kind.into();
        let op_id = derive_op_id(&author_id, lamport, ts, &kind, &payload);
        Self {
            op_id,
            author_id,
            lamport,
            ts,
            parents,
            kind,
            payload,
            space_id,
        }
    }

    /// Total-order key: `(lamport, op_id)`.
    pub fn order_key(&self) -> (u64, OpId) {
        (self.lamport, self.op_id)
    }
}

fn derive_op_id(
    author: &str,
    lamport: u64,
    ts: DateTime<Utc>,
    kind: &str,
    payload: &serde_json::Value,
) -> OpId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(author.as_bytes());
    hasher.update(&lamport.to_le_bytes());
    hasher.update(&ts.timestamp_micros().to_le_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(payload.to_string().as_bytes());
    OpId(*hasher.finalize().as_bytes())
}
