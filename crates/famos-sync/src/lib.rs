#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **famos-sync** – Operation-based CRDT replication between family devices.
//!
//! Each space is a DAG of operations ordered by Lamport clocks with
//! `(lamport, op_id)` as the total-order tiebreak. `add_op` accepts
//! duplicates silently, so every mutation is idempotent and merge order is
//! irrelevant: two devices that complete a sync round hold identical op
//! sets.
//!
//! Synchronization is push-pull over a pluggable [`Transport`]: HELLO/ACK
//! exchange per-space op counts, then for each space both sides INV their
//! op ids in chunks, GET what they are missing, and ship full OPS batches.
//! Op payloads cross the transport wrapped by a pluggable
//! [`CryptoProvider`] keyed per space; a frame that fails to unwrap is
//! dropped with an audit record, never applied.

use serde::{Deserialize, Serialize};

mod crypto;
mod dag;
mod log;
mod op;
mod protocol;
mod replicator;
mod transport;

pub use crypto::{ChaChaGroupCrypto, CryptoProvider, PassthroughCrypto};
pub use dag::SpaceDag;
pub use log::OpLog;
pub use op::{Op, OpId};
pub use protocol::SyncMessage;
pub use replicator::{Replicator, SyncReport};
pub use transport::{MemoryTransport, Transport};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Replicator tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum op ids per INV chunk.
    pub inv_chunk: usize,
    /// Backoff range (min, max) milliseconds between failed sync attempts.
    pub backoff_ms: (u64, u64),
    /// Attempts per [`Replicator::sync_with_backoff`] call.
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            inv_chunk: 256,
            backoff_ms: (500, 5_000),
            max_attempts: 4,
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Replication failures.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Transport send/recv failed (retryable with backoff).
    #[error("transport error: {0}")]
    Transport(String),
    /// Frame or op encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),
    /// A frame failed to unwrap; it was dropped and audited.
    #[error("decryption failed for space {space}")]
    Decryption {
        /// Space whose key failed.
        space: String,
    },
    /// No key material for a space.
    #[error("no group key for space {space}")]
    UnknownSpaceKey {
        /// The keyless space.
        space: String,
    },
    /// The peer broke the protocol state machine.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Ops log IO failed.
    #[error("op log io error: {0}")]
    Io(#[from] std::io::Error),
}
