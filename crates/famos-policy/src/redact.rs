//! PII redaction applied when the gate attaches redaction obligations.
//!
//! Matched values are replaced by `<kind:hash>` placeholders where the hash
//! is a short content digest, so equal values redact to equal placeholders
//! (dedup still works downstream) while the raw value never reaches a store.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use famos_types::{Envelope, Obligation};

use crate::PolicyError;

static PHONE: Lazy<Regex> = Lazy::new(|| {
    // International and local forms: +1-555-0100, (555) 010-0100, 555 010 0100.
    Regex::new(r"\+?\d[\d\s().-]{6,}\d").expect("phone pattern")
});

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern"));

/// Replace PII in `text` with `<kind:hash>` placeholders.
pub fn scrub_text(text: &str) -> String {
    let scrubbed = EMAIL.replace_all(text, |caps: &regex::Captures<'_>| {
        placeholder("email", &caps[0])
    });
    PHONE
        .replace_all(&scrubbed, |caps: &regex::Captures<'_>| {
            placeholder("phone", &caps[0])
        })
        .into_owned()
}

fn placeholder(kind: &str, value: &str) -> String {
    let normalized: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && !"().-".contains(*c))
        .collect();
    let digest = blake3::hash(normalized.as_bytes());
    let short = &digest.to_hex()[..12];
    format!("<{kind}:{short}>")
}

/// Apply redaction obligations to an envelope payload.
///
/// `TotalRedaction` empties every string field; `RedactPii` scrubs matched
/// tokens in place. Non-string payload values pass through untouched.
pub fn apply(
    mut envelope: Envelope,
    obligations: &BTreeSet<Obligation>,
) -> Result<Envelope, PolicyError> {
    let total = obligations.contains(&Obligation::TotalRedaction);
    redact_value(&mut envelope.payload, total);
    envelope.validate().map_err(|e| PolicyError::Redaction(e.to_string()))?;
    Ok(envelope)
}

fn redact_value(value: &mut serde_json::Value, total: bool) {
    match value {
        serde_json::Value::String(s) => {
            *s = if total { "<redacted>".to_string() } else { scrub_text(s) };
        }
        serde_json::Value::Array(items) => {
            for item in items {
                redact_value(item, total);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                redact_value(v, total);
            }
        }
        _ => {}
    }
}
