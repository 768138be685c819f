#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **famos-types** – Shared primitive data structures for FamilyOS.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the canonical [`Envelope`] message unit, the space / band
//! vocabulary, and the fixed event-type catalog. It intentionally makes no
//! assumptions about I/O, storage, or scheduling.

use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod clock;
pub mod envelope;
pub mod payload;
pub mod space;

pub use catalog::EventType;
pub use clock::ProducerClock;
pub use envelope::{Band, Envelope, EnvelopeBuilder, EnvelopeError, Obligation, QoS};
pub use space::{SpaceId, SpaceKind};

//─────────────────────────────
//  Validation limits
//─────────────────────────────

/// Maximum allowed topic name length.
pub const MAX_TOPIC_LEN: usize = 128;

/// Maximum allowed actor / device / person identifier length.
pub const MAX_PRINCIPAL_LEN: usize = 256;

/// Maximum serialized payload size to prevent memory exhaustion.
pub const MAX_PAYLOAD_BYTES: usize = 1_048_576; // 1MB

/// Maximum idempotency key length.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 512;

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Content-derived 128-bit identifier of an envelope or event.
pub type EventId = uuid::Uuid;

/// Family-member identifier (e.g. `"alice"`).
pub type ActorId = String;

/// Device identifier (e.g. `"alice-phone"`).
pub type DeviceId = String;

/// Optional person reference carried by people-centric payloads.
pub type PersonId = String;

/// Correlation identifier tying request / response envelope pairs together.
pub type CorrelationId = String;

/// Trace identifier propagated across a processing pipeline.
pub type TraceId = String;

//─────────────────────────────
//  Schema versioning
//─────────────────────────────

/// Version of the envelope wire schema. Bumped on any incompatible change
/// to [`Envelope`] field layout; pinned into every persisted record.
pub const SCHEMA_VERSION: u16 = 1;

/// Identifies the policy snapshot an envelope was evaluated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyVersion(pub u32);

impl std::fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}
