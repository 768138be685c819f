#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **famos-policy** – The policy gate every durable effect passes through.
//!
//! Evaluation combines the actor's role (RBAC), request attributes (ABAC:
//! device trust, space kind, time of day, supervision), the consent table,
//! and the envelope band into a single [`Decision`]. Workflow steps call the
//! gate before emitting side-effecting envelopes, and the action runner
//! re-checks at dispatch time.
//!
//! The engine is synchronous and pure over an immutable versioned snapshot;
//! updates swap the snapshot and bump [`famos_types::PolicyVersion`] so
//! cached decisions can be invalidated by version comparison alone.

use std::collections::BTreeSet;

use famos_types::{Band, Envelope, Obligation, PolicyVersion};

mod engine;
mod model;
pub mod redact;

pub use engine::FamilyPolicy;
pub use model::{ConsentVerdict, DeviceTrust, PolicySnapshot, RequestContext, Role};

//─────────────────────────────
//  Decision
//─────────────────────────────

/// Outcome of evaluating one envelope against the active policy snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Proceed unconditionally.
    Allow,
    /// Refuse; no side-effect may occur.
    Deny {
        /// Machine-readable reason, stable across versions.
        reason: String,
    },
    /// Proceed after honouring the attached obligations.
    AllowWithObligations(BTreeSet<Obligation>),
}

impl Decision {
    /// Whether the envelope may produce durable effects at all.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Deny { .. })
    }

    /// Obligations to honour, empty for plain allow / deny.
    pub fn obligations(&self) -> BTreeSet<Obligation> {
        match self {
            Decision::AllowWithObligations(obs) => obs.clone(),
            _ => BTreeSet::new(),
        }
    }
}

//─────────────────────────────
//  Engine trait
//─────────────────────────────

/// Small capability interface implemented by policy engines.
///
/// Kept object-safe so services hold an `Arc<dyn PolicyEngine>`.
pub trait PolicyEngine: Send + Sync {
    /// Evaluate an envelope in a request context.
    fn evaluate(&self, envelope: &Envelope, ctx: &RequestContext) -> Decision;

    /// Version of the active snapshot; bumped on every policy update.
    fn version(&self) -> PolicyVersion;
}

/// Evaluate, then apply redaction obligations to the envelope in one step.
///
/// Returns the (possibly rewritten) envelope on allow. The original payload
/// is never returned once a redaction obligation is attached, which is what
/// keeps raw PII out of every downstream store.
pub fn gate(
    engine: &dyn PolicyEngine,
    envelope: Envelope,
    ctx: &RequestContext,
) -> Result<Envelope, PolicyError> {
    match engine.evaluate(&envelope, ctx) {
        Decision::Deny { reason } => {
            tracing::warn!(
                actor = %envelope.actor,
                space = %envelope.space_id,
                band = %envelope.band,
                %reason,
                "policy denied envelope"
            );
            Err(PolicyError::Denied { reason })
        }
        Decision::Allow => Ok(envelope),
        Decision::AllowWithObligations(obs) => {
            let mut env = envelope;
            env.obligations.extend(obs.iter().copied());
            env.policy_version = engine.version();
            if obs.contains(&Obligation::RedactPii) || obs.contains(&Obligation::TotalRedaction) {
                env = redact::apply(env, &obs)?;
            }
            if obs.contains(&Obligation::AuditAccess) {
                tracing::info!(
                    actor = %env.actor,
                    space = %env.space_id,
                    band = %env.band,
                    envelope = %env.id,
                    "audited access"
                );
            }
            Ok(env)
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures surfaced by the gate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The gate refused the envelope.
    #[error("policy denied: {reason}")]
    Denied {
        /// Stable machine-readable reason.
        reason: String,
    },
    /// Redaction could not be applied; the envelope must not proceed.
    #[error("redaction failed: {0}")]
    Redaction(String),
}

/// Default obligations implied by a band before ABAC/consent adjustments.
pub(crate) fn band_obligations(band: Band) -> BTreeSet<Obligation> {
    let mut obs = BTreeSet::new();
    match band {
        Band::Green => {}
        Band::Amber => {
            obs.insert(Obligation::RedactPii);
        }
        Band::Red => {
            obs.insert(Obligation::RedactPii);
            obs.insert(Obligation::AuditAccess);
        }
        Band::Black => {
            obs.insert(Obligation::TotalRedaction);
            obs.insert(Obligation::AuditAccess);
        }
    }
    obs
}
