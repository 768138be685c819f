//! Policy vocabulary: roles, trust levels, consent, and the snapshot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use famos_types::{ActorId, SpaceKind};

/// Family role assigned to an actor (RBAC axis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Supervised family member.
    Child,
    /// Parent or guardian; may touch RED material.
    Guardian,
    /// Device administrator; the only role allowed BLACK material.
    Admin,
}

/// How much the producing device is trusted (ABAC axis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTrust {
    /// Unmanaged or unknown device.
    Low,
    /// Known device without hardware attestation.
    Medium,
    /// Attested family device.
    High,
}

/// Per `(actor, space kind)` consent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentVerdict {
    /// Writes permitted as-is.
    Allow,
    /// Writes permitted only with PII redaction.
    Redact,
    /// Writes refused.
    Deny,
}

/// Ambient attributes of the request being evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Trust level of the producing device.
    pub device_trust: DeviceTrust,
    /// Whether a guardian is actively supervising the session.
    pub supervised: bool,
    /// Evaluation instant (time-of-day restrictions key off this).
    pub now: DateTime<Utc>,
}

impl RequestContext {
    /// Context for a trusted, unsupervised device at `now`.
    pub fn trusted(now: DateTime<Utc>) -> Self {
        Self {
            device_trust: DeviceTrust::High,
            supervised: false,
            now,
        }
    }
}

/// Immutable policy state evaluated against. Swapped wholesale on update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Actor role table. Unlisted actors default to [`Role::Child`].
    pub roles: HashMap<ActorId, Role>,
    /// Consent table keyed by `(actor, space kind)`. Missing entries allow.
    pub consent: HashMap<(ActorId, SpaceKind), ConsentVerdict>,
    /// Local-time hour range `[start, end)` during which child writes to
    /// shared spaces are refused, when set.
    pub child_quiet_hours: Option<(u32, u32)>,
}

impl PolicySnapshot {
    /// Role for an actor, defaulting to the least-privileged.
    pub fn role_of(&self, actor: &str) -> Role {
        self.roles.get(actor).copied().unwrap_or(Role::Child)
    }

    /// Consent verdict for `(actor, kind)`, defaulting to allow.
    pub fn consent_for(&self, actor: &str, kind: SpaceKind) -> ConsentVerdict {
        self.consent
            .get(&(actor.to_string(), kind))
            .copied()
            .unwrap_or(ConsentVerdict::Allow)
    }
}
