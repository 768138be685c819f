#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **famos-bus** – Durable, per-topic event bus for FamilyOS.
//!
//! Every topic is an append-only write-ahead log of framed envelopes.
//! Consumer groups are durable: each `(group, topic)` pair persists a
//! committed offset plus its in-flight deliveries, so a crash resumes from
//! exactly where the group left off. Delivery is at-least-once with
//! per-group FIFO ordering; exactly-once is the handler's job via
//! `idempotency_key` dedup.
//!
//! Failed deliveries retry with jittered exponential backoff; envelopes that
//! exhaust their retries (or fail non-retryably) land on the parallel
//! `{topic}.dlq` log with failure metadata, and the group moves on.
//!
//! A non-durable broadcast tap is also exposed for components that only care
//! about live traffic (the workspace debouncer, tests).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use famos_types::Envelope;

mod bus;
mod frame;
mod offsets;
mod wal;

pub use bus::{DurableBus, SubscriptionHandle};
pub use offsets::{GroupOffsets, InFlight};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Bus tuning knobs; defaults follow the recognized configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// First retry delay.
    pub base_backoff_ms: u64,
    /// Retry delay ceiling.
    pub max_backoff_ms: u64,
    /// Delivery attempts before dead-lettering.
    pub max_retries: u32,
    /// Publish rejects with back-pressure once any group lags this far.
    pub lag_high_watermark: u64,
    /// Handler deadline when the envelope carries no `qos.timeout_ms`.
    pub default_timeout_ms: u64,
    /// Capacity of the live broadcast tap per topic.
    pub tap_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 50,
            max_backoff_ms: 5_000,
            max_retries: 5,
            lag_high_watermark: 10_000,
            default_timeout_ms: 30_000,
            tap_capacity: 1024,
        }
    }
}

//─────────────────────────────
//  Handler contract
//─────────────────────────────

/// Handler verdict for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; advance the group offset.
    Ack,
    /// Not processed. Retryable nacks back off and retry; non-retryable
    /// nacks dead-letter immediately.
    Nack {
        /// Whether redelivery can succeed.
        retryable: bool,
        /// Failure description carried into the DLQ record.
        reason: String,
    },
}

impl HandlerOutcome {
    /// Convenience non-retryable nack.
    pub fn reject(reason: impl Into<String>) -> Self {
        HandlerOutcome::Nack {
            retryable: false,
            reason: reason.into(),
        }
    }

    /// Convenience retryable nack.
    pub fn retry(reason: impl Into<String>) -> Self {
        HandlerOutcome::Nack {
            retryable: true,
            reason: reason.into(),
        }
    }
}

/// Durable consumer handler. Implementations MUST be idempotent: the same
/// envelope can be delivered more than once across crashes (dedup on
/// `envelope.id` or `idempotency_key`), and MUST observe `deadline`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one envelope. Exceeding `deadline` is treated as a retryable
    /// failure by the dispatcher.
    async fn handle(&self, envelope: Envelope, deadline: Duration) -> HandlerOutcome;
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Why a publish was refused.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// WAL append or fsync failed.
    #[error("bus io error: {0}")]
    Io(#[from] std::io::Error),
    /// Envelope failed structural validation.
    #[error("invalid envelope: {0}")]
    Invalid(String),
    /// A consumer group lags beyond the high watermark.
    #[error("back-pressure: slowest group lags {lag} records on topic {topic}")]
    BackPressure {
        /// Affected topic.
        topic: String,
        /// Current lag of the slowest group.
        lag: u64,
    },
}

/// Failures on the consume / administrative side.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Disk failure reading or writing bus state.
    #[error("bus io error: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted record failed its checksum or decode.
    #[error("corrupt record in {path} at offset {offset}")]
    Corrupt {
        /// File containing the record.
        path: String,
        /// Record offset.
        offset: u64,
    },
    /// Encode/decode failure for a record body.
    #[error("codec error: {0}")]
    Codec(String),
    /// Unknown `(group, topic)` pair.
    #[error("unknown subscription {group}/{topic}")]
    UnknownSubscription {
        /// Consumer group name.
        group: String,
        /// Topic name.
        topic: String,
    },
}

/// Metadata wrapper stored on `{topic}.dlq` logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    /// The envelope that failed.
    pub envelope: Envelope,
    /// Consumer group that gave up on it.
    pub group: String,
    /// Terminal failure reason.
    pub reason: String,
    /// Delivery attempts made.
    pub attempts: u32,
    /// When the envelope was dead-lettered.
    pub failed_at: chrono::DateTime<chrono::Utc>,
}
