//! Push-pull protocol frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::op::OpId;
use crate::SyncError;

/// Protocol messages. Control frames travel in the clear (they carry only
/// hashes and counts); op batches travel wrapped by the space's group key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "UPPERCASE")]
pub enum SyncMessage {
    /// Session opener: per-space op counts.
    Hello {
        /// `space → op count`.
        counts: BTreeMap<String, u64>,
    },
    /// Opener acknowledgement with the peer's counts.
    Ack {
        /// `space → op count`.
        counts: BTreeMap<String, u64>,
    },
    /// Inventory chunk of op ids for one space.
    Inv {
        /// Space wire form.
        space: String,
        /// Op ids in this chunk.
        ids: Vec<OpId>,
        /// Whether this is the sender's final chunk for the space.
        last: bool,
    },
    /// Request for ops the sender is missing.
    Get {
        /// Space wire form.
        space: String,
        /// Missing op ids.
        ids: Vec<OpId>,
    },
    /// Batch of full ops, wrapped by the space group key.
    Ops {
        /// Space wire form.
        space: String,
        /// `wrap(rmp(Vec<Op>))`.
        wrapped: Vec<u8>,
    },
}

impl SyncMessage {
    /// Encode for the transport.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(|e| SyncError::Codec(e.to_string()))
    }

    /// Decode from the transport.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(|e| SyncError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let mut counts = BTreeMap::new();
        counts.insert("shared:household".to_string(), 4u64);
        for msg in [
            SyncMessage::Hello {
                counts: counts.clone(),
            },
            SyncMessage::Ack { counts },
            SyncMessage::Inv {
                space: "shared:household".into(),
                ids: vec![OpId([1u8; 32])],
                last: true,
            },
            SyncMessage::Get {
                space: "shared:household".into(),
                ids: vec![],
            },
            SyncMessage::Ops {
                space: "shared:household".into(),
                wrapped: vec![1, 2, 3],
            },
        ] {
            let bytes = msg.encode().unwrap();
            assert_eq!(SyncMessage::decode(&bytes).unwrap(), msg);
        }
    }
}
