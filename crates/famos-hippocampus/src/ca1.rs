//! CA1 bridge: coarse entity extraction and triple projection.
//!
//! Rule lexicons only; no model inference. Output triples follow the
//! `(event:id, has_time, bucket)`, `(event:id, has_topic, keyword)`,
//! `(event:id, mentions, person)` shapes consumed by the KG store.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Timelike, Utc};
use once_cell::sync::Lazy;

use famos_types::payload::Triple;
use famos_types::EventId;

static STOPWORDS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "a", "about", "after", "all", "an", "and", "are", "at", "be", "before", "but", "by",
        "for", "from", "get", "go", "had", "has", "have", "he", "her", "his", "i", "in", "is",
        "it", "its", "me", "my", "no", "not", "of", "on", "or", "our", "out", "she", "so",
        "that", "the", "their", "them", "then", "there", "they", "this", "to", "up", "was",
        "we", "were", "will", "with", "you", "your",
    ]
    .into_iter()
    .collect()
});

/// Maximum keywords projected per event.
const MAX_TOPICS: usize = 5;

/// Extract coarse entities from content and project them as triples.
///
/// `people` is the family lexicon (known given names, lowercased); words are
/// matched case-insensitively. Keywords are the longest non-stopword tokens.
pub fn project_triples(
    event_id: &EventId,
    text: &str,
    ts: DateTime<Utc>,
    people: &BTreeSet<String>,
) -> Vec<Triple> {
    let subject = Triple::event_subject(event_id);
    let mut triples = vec![Triple {
        subject: subject.clone(),
        predicate: "has_time".into(),
        object: format!(
            "{:04}-{:02}-{:02}-{:02}",
            ts.year(),
            ts.month(),
            ts.day(),
            ts.hour()
        ),
        observed_at: ts,
    }];

    let mut mentioned = BTreeSet::new();
    let mut keywords: Vec<String> = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        let word = raw.to_lowercase();
        if people.contains(&word) {
            mentioned.insert(word.clone());
            continue;
        }
        if word.len() >= 4 && !STOPWORDS.contains(word.as_str()) && !keywords.contains(&word) {
            keywords.push(word);
        }
    }
    keywords.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    keywords.truncate(MAX_TOPICS);

    for keyword in keywords {
        triples.push(Triple {
            subject: subject.clone(),
            predicate: "has_topic".into(),
            object: keyword,
            observed_at: ts,
        });
    }
    for person in mentioned {
        triples.push(Triple {
            subject: subject.clone(),
            predicate: "mentions".into(),
            object: format!("person:{person}"),
            observed_at: ts,
        });
    }
    triples
}
