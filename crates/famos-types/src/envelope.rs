//! The canonical, immutable message unit crossing every module boundary.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::EventType;
use crate::space::SpaceId;
use crate::{
    ActorId, CorrelationId, DeviceId, EventId, PersonId, PolicyVersion, TraceId,
    MAX_IDEMPOTENCY_KEY_LEN, MAX_PAYLOAD_BYTES, MAX_PRINCIPAL_LEN, MAX_TOPIC_LEN, SCHEMA_VERSION,
};

//─────────────────────────────
//  Bands and obligations
//─────────────────────────────

/// Sensitivity class gating redaction, retention, and access.
///
/// Bands are totally ordered; `Band::Amber < Band::Red` reads as "less
/// sensitive than".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Band {
    /// Minimal restrictions.
    #[default]
    Green,
    /// Redaction obligations apply; default for sensor-derived input.
    Amber,
    /// Parents / admin only; mandatory audit.
    Red,
    /// Admin only; derived artifacts are fully redacted.
    Black,
}

impl Band {
    /// Stable uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Green => "GREEN",
            Band::Amber => "AMBER",
            Band::Red => "RED",
            Band::Black => "BLACK",
        }
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy obligation tag attached by the gate and honoured downstream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Obligation {
    /// Strip or hash personally identifying tokens from the payload.
    RedactPii,
    /// Record an audit trail entry for every access.
    AuditAccess,
    /// Derived artifacts must carry no content at all.
    TotalRedaction,
    /// Delete after the space retention window.
    ExpireAfterRetention,
}

//─────────────────────────────
//  Quality of service
//─────────────────────────────

/// Optional per-envelope delivery preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QoS {
    /// Handler deadline; the bus default applies when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retry cap before dead-lettering; the bus default applies when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Relative priority; higher is degraded last under back-pressure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

//─────────────────────────────
//  Envelope
//─────────────────────────────

/// Canonical event/message structure. Envelopes are immutable after
/// [`EnvelopeBuilder::seal`]; the `id` is derived from content so replays and
/// duplicates are detectable by identity alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Content-derived identifier, unique per `(topic, space, content)`.
    pub id: EventId,
    /// Producer-assigned UTC instant, monotone per producer.
    pub ts: DateTime<Utc>,
    /// Trace identifier for cross-component correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// Ties request/response envelope pairs together.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Destination topic.
    pub topic: String,
    /// Catalog type.
    pub event_type: EventType,
    /// Memory scope.
    pub space_id: SpaceId,
    /// Producing family member.
    pub actor: ActorId,
    /// Producing device.
    pub device: DeviceId,
    /// Optional person the payload is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<PersonId>,
    /// Sensitivity band.
    pub band: Band,
    /// Policy snapshot the envelope was evaluated under.
    pub policy_version: PolicyVersion,
    /// Obligations attached by the gate.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub obligations: BTreeSet<Obligation>,
    /// Optional delivery preferences.
    #[serde(default, skip_serializing_if = "is_default_qos")]
    pub qos: QoS,
    /// Producer-chosen dedup key, unique within `(topic, space_id)`.
    pub idempotency_key: String,
    /// Typed payload, schema per `event_type`.
    pub payload: serde_json::Value,
    /// Optional device signature for non-repudiation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    /// Envelope wire-schema version.
    pub schema_version: u16,
}

fn is_default_qos(q: &QoS) -> bool {
    *q == QoS::default()
}

impl Envelope {
    /// Start building an envelope with the required routing fields.
    pub fn builder(
        topic: impl Into<String>,
        event_type: EventType,
        space_id: SpaceId,
        actor: impl Into<ActorId>,
        device: impl Into<DeviceId>,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder {
            topic: topic.into(),
            event_type,
            space_id,
            actor: actor.into(),
            device: device.into(),
            person_id: None,
            band: Band::default(),
            policy_version: PolicyVersion(0),
            obligations: BTreeSet::new(),
            qos: QoS::default(),
            trace_id: None,
            correlation_id: None,
            idempotency_key: None,
            payload: serde_json::Value::Null,
            signature: None,
        }
    }

    /// Validate an existing envelope against the structural limits.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.topic.is_empty() || self.topic.len() > MAX_TOPIC_LEN {
            return Err(EnvelopeError::InvalidTopic(self.topic.clone()));
        }
        if self.actor.is_empty() || self.actor.len() > MAX_PRINCIPAL_LEN {
            return Err(EnvelopeError::InvalidPrincipal("actor".into()));
        }
        if self.device.is_empty() || self.device.len() > MAX_PRINCIPAL_LEN {
            return Err(EnvelopeError::InvalidPrincipal("device".into()));
        }
        if self.idempotency_key.is_empty()
            || self.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN
        {
            return Err(EnvelopeError::InvalidIdempotencyKey);
        }
        let payload_len = serde_json::to_vec(&self.payload)
            .map_err(|e| EnvelopeError::Payload(e.to_string()))?
            .len();
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(EnvelopeError::PayloadTooLarge(payload_len));
        }
        Ok(())
    }

    /// Deserialize the payload into its typed form.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| EnvelopeError::Payload(e.to_string()))
    }

    /// Derive a child envelope id deterministic in `(parent, step)`, used by
    /// workflow steps to keep downstream effects idempotent across replays.
    pub fn derived_idempotency_key(parent_key: &str, step: &str) -> String {
        format!("{parent_key}/{step}")
    }
}

//─────────────────────────────
//  Builder
//─────────────────────────────

/// Builder producing a sealed, validated [`Envelope`].
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    topic: String,
    event_type: EventType,
    space_id: SpaceId,
    actor: ActorId,
    device: DeviceId,
    person_id: Option<PersonId>,
    band: Band,
    policy_version: PolicyVersion,
    obligations: BTreeSet<Obligation>,
    qos: QoS,
    trace_id: Option<TraceId>,
    correlation_id: Option<CorrelationId>,
    idempotency_key: Option<String>,
    payload: serde_json::Value,
    signature: Option<Vec<u8>>,
}

impl EnvelopeBuilder {
    /// Set the sensitivity band.
    pub fn band(mut self, band: Band) -> Self {
        self.band = band;
        self
    }

    /// Pin the policy snapshot version.
    pub fn policy_version(mut self, v: PolicyVersion) -> Self {
        self.policy_version = v;
        self
    }

    /// Attach an obligation.
    pub fn obligation(mut self, o: Obligation) -> Self {
        self.obligations.insert(o);
        self
    }

    /// Set delivery preferences.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set the trace id.
    pub fn trace_id(mut self, t: impl Into<TraceId>) -> Self {
        self.trace_id = Some(t.into());
        self
    }

    /// Set the correlation id.
    pub fn correlation_id(mut self, c: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(c.into());
        self
    }

    /// Name the person the payload is about.
    pub fn person_id(mut self, p: impl Into<PersonId>) -> Self {
        self.person_id = Some(p.into());
        self
    }

    /// Set an explicit idempotency key. When absent, `seal` derives one from
    /// the content digest.
    pub fn idempotency_key(mut self, k: impl Into<String>) -> Self {
        self.idempotency_key = Some(k.into());
        self
    }

    /// Set the typed payload, serialized as JSON.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, EnvelopeError> {
        self.payload =
            serde_json::to_value(payload).map_err(|e| EnvelopeError::Payload(e.to_string()))?;
        Ok(self)
    }

    /// Attach a device signature over the content digest.
    pub fn signature(mut self, sig: Vec<u8>) -> Self {
        self.signature = Some(sig);
        self
    }

    /// Seal into an immutable envelope: assign `ts` from `clock`, derive the
    /// content id, and validate.
    pub fn seal(self, ts: DateTime<Utc>) -> Result<Envelope, EnvelopeError> {
        let digest = content_digest(
            &self.topic,
            &self.space_id,
            &self.actor,
            ts,
            self.idempotency_key.as_deref(),
            &self.payload,
        )?;
        let id = Uuid::from_bytes(digest);
        let idempotency_key = self
            .idempotency_key
            .unwrap_or_else(|| id.simple().to_string());
        let env = Envelope {
            id,
            ts,
            trace_id: self.trace_id,
            correlation_id: self.correlation_id,
            topic: self.topic,
            event_type: self.event_type,
            space_id: self.space_id,
            actor: self.actor,
            device: self.device,
            person_id: self.person_id,
            band: self.band,
            policy_version: self.policy_version,
            obligations: self.obligations,
            qos: self.qos,
            idempotency_key,
            payload: self.payload,
            signature: self.signature,
            schema_version: SCHEMA_VERSION,
        };
        env.validate()?;
        Ok(env)
    }
}

/// Blake3 content digest over the identity-bearing fields, truncated to the
/// 128 bits a [`Uuid`] can carry.
fn content_digest(
    topic: &str,
    space_id: &SpaceId,
    actor: &str,
    ts: DateTime<Utc>,
    idempotency_key: Option<&str>,
    payload: &serde_json::Value,
) -> Result<[u8; 16], EnvelopeError> {
    #[derive(Serialize)]
    struct IdentityFields<'a> {
        topic: &'a str,
        space_id: String,
        actor: &'a str,
        ts_micros: i64,
        idempotency_key: Option<&'a str>,
        payload: &'a serde_json::Value,
    }
    let bytes = rmp_serde::to_vec(&IdentityFields {
        topic,
        space_id: space_id.to_string(),
        actor,
        ts_micros: ts.timestamp_micros(),
        idempotency_key,
        payload,
    })
    .map_err(|e| EnvelopeError::Payload(e.to_string()))?;
    let hash = blake3::hash(&bytes);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash.as_bytes()[..16]);
    Ok(out)
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Structural validation failures for envelopes and spaces.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// Topic name empty or over the length limit.
    #[error("invalid topic: {0:?}")]
    InvalidTopic(String),
    /// Space id failed to parse or validate.
    #[error("invalid space id: {0:?}")]
    InvalidSpace(String),
    /// Actor or device identifier out of bounds.
    #[error("invalid principal field: {0}")]
    InvalidPrincipal(String),
    /// Idempotency key empty or over the length limit.
    #[error("invalid idempotency key")]
    InvalidIdempotencyKey,
    /// Payload failed to serialize or deserialize.
    #[error("payload error: {0}")]
    Payload(String),
    /// Payload exceeds the size limit.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SpaceKind;
    use chrono::TimeZone;

    fn space() -> SpaceId {
        SpaceId::new(SpaceKind::Shared, "household").unwrap()
    }

    fn seal_basic(key: &str) -> Envelope {
        let ts = Utc.with_ymd_and_hms(2025, 9, 6, 12, 42, 0).unwrap();
        Envelope::builder("memory.write", EventType::WriteAccepted, space(), "alice", "alice-phone")
            .idempotency_key(key)
            .payload(&serde_json::json!({"text": "Dinner plan"}))
            .unwrap()
            .seal(ts)
            .unwrap()
    }

    #[test]
    fn id_is_content_derived_and_stable() {
        let a = seal_basic("w-1");
        let b = seal_basic("w-1");
        assert_eq!(a.id, b.id);
        let c = seal_basic("w-2");
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn bands_are_ordered_by_sensitivity() {
        assert!(Band::Green < Band::Amber);
        assert!(Band::Amber < Band::Red);
        assert!(Band::Red < Band::Black);
    }

    #[test]
    fn rejects_oversized_topic() {
        let ts = Utc::now();
        let long = "t".repeat(MAX_TOPIC_LEN + 1);
        let err = Envelope::builder(long, EventType::WriteAccepted, space(), "a", "d")
            .idempotency_key("k")
            .seal(ts)
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidTopic(_)));
    }

    #[test]
    fn wire_round_trip_via_messagepack() {
        let env = seal_basic("w-1");
        let bytes = rmp_serde::to_vec_named(&env).unwrap();
        let back: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, env);
    }
}
