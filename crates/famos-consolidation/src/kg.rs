//! Knowledge-graph store and pattern-based relation projection.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

use famos_types::payload::Triple;

use crate::ConsolidationError;

const SEP: u8 = 0x1f;

/// Relation verbs the projector recognizes, with the predicate each maps to.
static RELATION_VERBS: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("called", "called"),
        ("visited", "visited"),
        ("bought", "bought"),
        ("promised", "promised"),
        ("due on", "due_on"),
    ]
});

/// Sled-backed triple store (`kg/triples.kv` in the storage layout).
#[derive(Debug, Clone)]
pub struct KgStore {
    tree: sled::Tree,
}

impl KgStore {
    /// Open the store inside an existing sled database.
    pub fn open(db: &sled::Db) -> Result<Self, ConsolidationError> {
        Ok(Self {
            tree: db.open_tree("kg_triples")?,
        })
    }

    fn key(triple: &Triple) -> Vec<u8> {
        let mut key = Vec::new();
        key.extend_from_slice(triple.subject.as_bytes());
        key.push(SEP);
        key.extend_from_slice(triple.predicate.as_bytes());
        key.push(SEP);
        key.extend_from_slice(triple.object.as_bytes());
        key
    }

    /// Append a triple; re-appending the same `(s, p, o)` keeps the earliest
    /// observation time.
    pub fn append(&self, triple: &Triple) -> Result<bool, ConsolidationError> {
        let key = Self::key(triple);
        if self.tree.contains_key(&key)? {
            return Ok(false);
        }
        let value = rmp_serde::to_vec(&triple.observed_at)
            .map_err(|e| ConsolidationError::Codec(e.to_string()))?;
        self.tree.insert(key, value)?;
        Ok(true)
    }

    /// All triples for a subject.
    pub fn by_subject(&self, subject: &str) -> Result<Vec<Triple>, ConsolidationError> {
        let mut prefix = subject.as_bytes().to_vec();
        prefix.push(SEP);
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(&prefix) {
            let (key, value) = entry?;
            let observed_at: DateTime<Utc> = rmp_serde::from_slice(&value)
                .map_err(|e| ConsolidationError::Codec(e.to_string()))?;
            let parts: Vec<&[u8]> = key.split(|&b| b == SEP).collect();
            if parts.len() == 3 {
                out.push(Triple {
                    subject: String::from_utf8_lossy(parts[0]).into_owned(),
                    predicate: String::from_utf8_lossy(parts[1]).into_owned(),
                    object: String::from_utf8_lossy(parts[2]).into_owned(),
                    observed_at,
                });
            }
        }
        Ok(out)
    }

    /// Total triple count.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Extract relations from rollup text by verb patterns.
///
/// For every sentence containing a recognized verb, the last word before the
/// verb becomes the subject and up to four words after it the object:
/// `"Alice called the dentist"` → `(person:alice, called, the dentist)`.
pub fn project_relations(text: &str, observed_at: DateTime<Utc>) -> Vec<Triple> {
    let mut triples = Vec::new();
    for sentence in text.split(['.', '!', '?', '\n']) {
        let lower = sentence.to_lowercase();
        for (verb, predicate) in RELATION_VERBS.iter() {
            let Some(pos) = lower.find(verb) else {
                continue;
            };
            let before = &lower[..pos];
            let after = &lower[pos + verb.len()..];
            let subject = before
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .next_back();
            let object: Vec<&str> = after
                .split(|c: char| !c.is_alphanumeric() && c != ' ')
                .flat_map(|chunk| chunk.split_whitespace())
                .take(4)
                .collect();
            if let (Some(subject), false) = (subject, object.is_empty()) {
                triples.push(Triple {
                    subject: format!("person:{subject}"),
                    predicate: (*predicate).to_string(),
                    object: object.join(" "),
                    observed_at,
                });
            }
        }
    }
    triples
}
