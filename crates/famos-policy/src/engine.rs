//! The family policy engine: RBAC + ABAC + band over a versioned snapshot.

use std::sync::RwLock;

use chrono::Timelike;

use famos_types::{Band, Envelope, Obligation, PolicyVersion, SpaceKind};

use crate::model::{ConsentVerdict, DeviceTrust, PolicySnapshot, RequestContext, Role};
use crate::{band_obligations, Decision, PolicyEngine};

/// Read-mostly policy engine. Evaluation takes the read lock only long
/// enough to clone the `Arc`-free snapshot fields it needs; updates replace
/// the snapshot and bump the version.
#[derive(Debug)]
pub struct FamilyPolicy {
    inner: RwLock<Versioned>,
}

#[derive(Debug)]
struct Versioned {
    snapshot: PolicySnapshot,
    version: PolicyVersion,
}

impl FamilyPolicy {
    /// Engine over an initial snapshot, starting at version 1.
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            inner: RwLock::new(Versioned {
                snapshot,
                version: PolicyVersion(1),
            }),
        }
    }

    /// Replace the snapshot; all caches keyed by the old version go stale.
    pub fn update(&self, snapshot: PolicySnapshot) -> PolicyVersion {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.snapshot = snapshot;
        inner.version = PolicyVersion(inner.version.0 + 1);
        tracing::info!(version = %inner.version, "policy snapshot updated");
        inner.version
    }

    fn evaluate_locked(
        snapshot: &PolicySnapshot,
        envelope: &Envelope,
        ctx: &RequestContext,
    ) -> Decision {
        let role = snapshot.role_of(&envelope.actor);

        // Band gate first: BLACK and RED are role-restricted outright.
        match envelope.band {
            Band::Black if role != Role::Admin => {
                return Decision::Deny {
                    reason: "band_black_requires_admin".into(),
                }
            }
            Band::Red if role == Role::Child && !ctx.supervised => {
                return Decision::Deny {
                    reason: "band_red_requires_guardian".into(),
                }
            }
            _ => {}
        }

        // Consent table.
        match snapshot.consent_for(&envelope.actor, envelope.space_id.kind) {
            ConsentVerdict::Deny => {
                return Decision::Deny {
                    reason: "consent_denied".into(),
                }
            }
            ConsentVerdict::Redact => {
                let mut obs = band_obligations(envelope.band);
                obs.insert(Obligation::RedactPii);
                return Decision::AllowWithObligations(obs);
            }
            ConsentVerdict::Allow => {}
        }

        // ABAC adjustments.
        if role == Role::Child
            && envelope.space_id.kind != SpaceKind::Personal
            && snapshot
                .child_quiet_hours
                .map(|(start, end)| in_hour_range(ctx.now.hour(), start, end))
                .unwrap_or(false)
        {
            return Decision::Deny {
                reason: "quiet_hours".into(),
            };
        }

        let mut obs = band_obligations(envelope.band);

        // AMBER redaction is waived only on attested devices.
        if envelope.band == Band::Amber && ctx.device_trust == DeviceTrust::High {
            obs.remove(&Obligation::RedactPii);
        }
        // Low-trust devices always redact outside personal spaces.
        if ctx.device_trust == DeviceTrust::Low && envelope.space_id.kind != SpaceKind::Personal {
            obs.insert(Obligation::RedactPii);
        }

        if obs.is_empty() {
            Decision::Allow
        } else {
            Decision::AllowWithObligations(obs)
        }
    }
}

fn in_hour_range(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        (start..end).contains(&hour)
    } else {
        // Wraps midnight, e.g. 21..7.
        hour >= start || hour < end
    }
}

impl PolicyEngine for FamilyPolicy {
    fn evaluate(&self, envelope: &Envelope, ctx: &RequestContext) -> Decision {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Self::evaluate_locked(&inner.snapshot, envelope, ctx)
    }

    fn version(&self) -> PolicyVersion {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use famos_types::{EventType, SpaceId};

    fn envelope(actor: &str, band: Band, space: &str) -> Envelope {
        Envelope::builder(
            "memory.write",
            EventType::WriteAccepted,
            SpaceId::parse(space).unwrap(),
            actor,
            "test-device",
        )
        .band(band)
        .idempotency_key("k-1")
        .seal(Utc.with_ymd_and_hms(2025, 9, 6, 12, 0, 0).unwrap())
        .unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext::trusted(Utc.with_ymd_and_hms(2025, 9, 6, 12, 0, 0).unwrap())
    }

    fn engine_with_roles() -> FamilyPolicy {
        let mut snapshot = PolicySnapshot::default();
        snapshot.roles.insert("mom".into(), Role::Admin);
        snapshot.roles.insert("dad".into(), Role::Guardian);
        snapshot.roles.insert("kid".into(), Role::Child);
        FamilyPolicy::new(snapshot)
    }

    #[test]
    fn black_band_denied_for_non_admin() {
        let engine = engine_with_roles();
        for actor in ["dad", "kid"] {
            let d = engine.evaluate(&envelope(actor, Band::Black, "shared:household"), &ctx());
            assert!(!d.is_allowed(), "{actor} must not write BLACK");
        }
        let d = engine.evaluate(&envelope("mom", Band::Black, "shared:household"), &ctx());
        assert!(d.is_allowed());
        assert!(d.obligations().contains(&Obligation::TotalRedaction));
    }

    #[test]
    fn red_band_needs_guardian_or_supervision() {
        let engine = engine_with_roles();
        let env = envelope("kid", Band::Red, "shared:household");
        assert!(!engine.evaluate(&env, &ctx()).is_allowed());

        let supervised = RequestContext {
            supervised: true,
            ..ctx()
        };
        assert!(engine.evaluate(&env, &supervised).is_allowed());
    }

    #[test]
    fn amber_redaction_waived_on_high_trust_device() {
        let engine = engine_with_roles();
        let env = envelope("dad", Band::Amber, "shared:household");
        let high = engine.evaluate(&env, &ctx());
        assert!(!high.obligations().contains(&Obligation::RedactPii));

        let low = RequestContext {
            device_trust: DeviceTrust::Medium,
            ..ctx()
        };
        let d = engine.evaluate(&env, &low);
        assert!(d.obligations().contains(&Obligation::RedactPii));
    }

    #[test]
    fn consent_deny_wins() {
        let mut snapshot = PolicySnapshot::default();
        snapshot
            .consent
            .insert(("kid".into(), SpaceKind::Shared), ConsentVerdict::Deny);
        let engine = FamilyPolicy::new(snapshot);
        let d = engine.evaluate(&envelope("kid", Band::Green, "shared:household"), &ctx());
        assert_eq!(
            d,
            Decision::Deny {
                reason: "consent_denied".into()
            }
        );
    }

    #[test]
    fn update_bumps_version() {
        let engine = engine_with_roles();
        let v1 = engine.version();
        let v2 = engine.update(PolicySnapshot::default());
        assert!(v2 > v1);
    }
}
