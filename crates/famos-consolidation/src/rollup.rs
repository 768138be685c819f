//! Extractive rollups: tf-idf + MMR sentence selection, light rewrite,
//! Markdown rendering with provenance.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use famos_types::{EventId, SpaceId};

use crate::{ConsolidationConfig, ConsolidationError, Episode};

/// Rollup periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// One local day.
    Day,
    /// One ISO week.
    Week,
    /// One calendar month.
    Month,
}

impl Period {
    /// Directory name in the rollup store.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
        }
    }
}

/// A periodic compact summary with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    /// Rollup id.
    pub rollup_id: Uuid,
    /// Summarized space.
    pub space_id: SpaceId,
    /// Period class.
    pub period: Period,
    /// Window start.
    pub from: DateTime<Utc>,
    /// Window end.
    pub to: DateTime<Utc>,
    /// Markdown summary.
    pub summary_text: String,
    /// Selected highlight sentences, most relevant first.
    pub highlights: Vec<String>,
    /// Events the summary was built from.
    pub provenance: BTreeSet<EventId>,
    /// Version, bumped by reconsolidation.
    pub version: u32,
}

//─────────────────────────────
//  Sentence selection
//─────────────────────────────

fn split_sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn sentence_tokens(sentence: &str) -> Vec<String> {
    sentence
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(|w| w.to_lowercase())
        .collect()
}

fn token_overlap_cosine(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let sa: BTreeSet<&String> = a.iter().collect();
    let sb: BTreeSet<&String> = b.iter().collect();
    let inter = sa.intersection(&sb).count() as f64;
    inter / ((sa.len() as f64).sqrt() * (sb.len() as f64).sqrt())
}

/// One scored candidate sentence with its source event.
struct ScoredSentence {
    text: String,
    tokens: Vec<String>,
    tfidf: f64,
    recency: f64,
    source: EventId,
}

/// Select sentences by MMR: `score = λ·tfidf + (1−λ)·recency − μ·max cos`
/// against the already-selected set, stopping at the token budget.
fn select_sentences(
    episodes: &[Episode],
    window_end: DateTime<Utc>,
    token_budget: usize,
    lambda: f64,
    mu: f64,
) -> Vec<ScoredSentence> {
    // Document frequency over all sentences in the window.
    let mut candidates: Vec<ScoredSentence> = Vec::new();
    let mut doc_freq: HashMap<String, usize> = HashMap::new();
    let mut all: Vec<(Vec<String>, String, EventId, DateTime<Utc>)> = Vec::new();
    for episode in episodes {
        for sentence in split_sentences(&episode.text) {
            let tokens = sentence_tokens(&sentence);
            for token in tokens.iter().collect::<BTreeSet<_>>() {
                *doc_freq.entry(token.clone()).or_insert(0) += 1;
            }
            all.push((tokens, sentence, episode.event_id, episode.ts));
        }
    }
    let n_sentences = all.len().max(1) as f64;

    for (tokens, sentence, source, ts) in all {
        let tfidf: f64 = {
            let mut tf: HashMap<&String, usize> = HashMap::new();
            for t in &tokens {
                *tf.entry(t).or_insert(0) += 1;
            }
            tf.iter()
                .map(|(token, &count)| {
                    let df = doc_freq.get(*token).copied().unwrap_or(1) as f64;
                    count as f64 * (n_sentences / df).ln_1p()
                })
                .sum::<f64>()
                / (tokens.len().max(1) as f64)
        };
        let age_hours = (window_end - ts).num_milliseconds().max(0) as f64 / 3_600_000.0;
        let recency = (2f64).powf(-age_hours / 72.0);
        candidates.push(ScoredSentence {
            text: sentence,
            tokens,
            tfidf,
            recency,
            source,
        });
    }

    // Normalize tf-idf into [0, 1] so λ mixes comparable quantities.
    let max_tfidf = candidates
        .iter()
        .map(|c| c.tfidf)
        .fold(f64::MIN, f64::max)
        .max(1e-9);
    for candidate in &mut candidates {
        candidate.tfidf /= max_tfidf;
    }

    let mut selected: Vec<ScoredSentence> = Vec::new();
    let mut used_tokens = 0usize;
    while !candidates.is_empty() && used_tokens < token_budget {
        let (best_idx, _) = candidates
            .iter()
            .enumerate()
            .map(|(idx, c)| {
                let redundancy = selected
                    .iter()
                    .map(|s| token_overlap_cosine(&c.tokens, &s.tokens))
                    .fold(0.0, f64::max);
                (
                    idx,
                    lambda * c.tfidf + (1.0 - lambda) * c.recency - mu * redundancy,
                )
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .expect("candidates is non-empty");
        let chosen = candidates.swap_remove(best_idx);
        used_tokens += chosen.tokens.len();
        selected.push(chosen);
    }
    selected
}

//─────────────────────────────
//  Light rewrite
//─────────────────────────────

/// Rule-based cleanup: filler prefixes dropped, simple tense normalization,
/// whitespace collapsed, terminal punctuation ensured.
pub(crate) fn light_rewrite(sentence: &str) -> String {
    let mut s = sentence.trim().to_string();
    for prefix in ["note:", "reminder:", "fyi:", "todo:"] {
        if s.to_lowercase().starts_with(prefix) {
            s = s[prefix.len()..].trim_start().to_string();
        }
    }
    for (from, to) in [
        ("is going to ", "will "),
        ("are going to ", "will "),
        ("gonna ", "going to "),
    ] {
        s = s.replace(from, to);
    }
    let mut out = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some(first) = out.get(..1) {
        let upper = first.to_uppercase();
        out.replace_range(..1, &upper);
    }
    if !out.ends_with(['.', '!', '?']) {
        out.push('.');
    }
    out
}

//─────────────────────────────
//  Building
//─────────────────────────────

/// Build a rollup for `episodes` inside `[from, to)`.
pub fn build_rollup(
    space: &SpaceId,
    period: Period,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    episodes: &[Episode],
    config: &ConsolidationConfig,
) -> Rollup {
    let budget = match period {
        Period::Day => config.tokens_per_day,
        Period::Week => config.tokens_per_week,
        Period::Month => config.tokens_per_week * 3,
    };
    let selected = select_sentences(episodes, to, budget, config.mmr_lambda, config.mmr_mu);

    let highlights: Vec<String> = selected.iter().map(|s| light_rewrite(&s.text)).collect();
    let provenance: BTreeSet<EventId> = selected.iter().map(|s| s.source).collect();

    let mut summary = format!(
        "# {} rollup for {}\n\n_{} → {}_\n\n",
        period.dir_name(),
        space,
        from.format("%Y-%m-%d %H:%M"),
        to.format("%Y-%m-%d %H:%M"),
    );
    for highlight in &highlights {
        summary.push_str(&format!("- {highlight}\n"));
    }
    summary.push_str("\n## Provenance\n\n");
    for event_id in &provenance {
        summary.push_str(&format!("- event:{}\n", event_id.simple()));
    }

    Rollup {
        rollup_id: Uuid::new_v4(),
        space_id: space.clone(),
        period,
        from,
        to,
        summary_text: summary,
        highlights,
        provenance,
        version: 1,
    }
}

//─────────────────────────────
//  Store
//─────────────────────────────

/// Filesystem rollup store (`rollups/<period>/<rollup_id>.json`).
#[derive(Debug, Clone)]
pub struct RollupStore {
    root: PathBuf,
}

impl RollupStore {
    /// Open (creating) the rollup root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ConsolidationError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, period: Period, rollup_id: &Uuid, version: u32) -> PathBuf {
        self.root.join(period.dir_name()).join(format!(
            "{}-v{}.json",
            rollup_id.simple(),
            version
        ))
    }

    /// Persist a rollup version atomically.
    pub fn save(&self, rollup: &Rollup) -> Result<(), ConsolidationError> {
        let path = self.path(rollup.period, &rollup.rollup_id, rollup.version);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(rollup)
            .map_err(|e| ConsolidationError::Codec(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load one rollup version.
    pub fn load(
        &self,
        period: Period,
        rollup_id: &Uuid,
        version: u32,
    ) -> Result<Option<Rollup>, ConsolidationError> {
        match std::fs::read(self.path(period, rollup_id, version)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ConsolidationError::Codec(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use famos_types::{Band, SpaceKind};

    fn episode(text: &str, ts: &str) -> Episode {
        Episode {
            event_id: Uuid::new_v4(),
            space_id: SpaceId::new(SpaceKind::Shared, "household").unwrap(),
            ts: ts.parse().unwrap(),
            text: text.to_string(),
            author: "alice".into(),
            band: Band::Green,
            affect_confidence: 0.5,
        }
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            "2025-09-06T00:00:00Z".parse().unwrap(),
            "2025-09-07T00:00:00Z".parse().unwrap(),
        )
    }

    #[test]
    fn rollup_carries_highlights_and_full_provenance() {
        let (from, to) = window();
        let episodes = vec![
            episode(
                "Sofia's school play rehearsal moved to Thursday evening.",
                "2025-09-06T09:00:00Z",
            ),
            episode(
                "Bought the birthday present for grandma, wrapping paper still needed.",
                "2025-09-06T15:30:00Z",
            ),
        ];
        let space = SpaceId::new(SpaceKind::Shared, "household").unwrap();
        let rollup = build_rollup(
            &space,
            Period::Day,
            from,
            to,
            &episodes,
            &ConsolidationConfig::default(),
        );
        assert!(!rollup.highlights.is_empty());
        assert_eq!(rollup.provenance.len(), 2);
        assert!(rollup.summary_text.contains("## Provenance"));
        assert_eq!(rollup.version, 1);
    }

    #[test]
    fn token_budget_bounds_the_selection() {
        let (from, to) = window();
        let episodes: Vec<Episode> = (0..100)
            .map(|i| {
                episode(
                    &format!("Completely distinct fact number {i} about topic {i} today."),
                    "2025-09-06T12:00:00Z",
                )
            })
            .collect();
        let space = SpaceId::new(SpaceKind::Shared, "household").unwrap();
        let mut config = ConsolidationConfig::default();
        config.tokens_per_day = 30;
        let rollup = build_rollup(&space, Period::Day, from, to, &episodes, &config);
        let total_tokens: usize = rollup
            .highlights
            .iter()
            .map(|h| h.split_whitespace().count())
            .sum();
        assert!(total_tokens <= 45, "selected {total_tokens} tokens");
    }

    #[test]
    fn mmr_suppresses_redundant_sentences() {
        let (from, to) = window();
        let episodes = vec![
            episode("Dinner plan for saturday with the cousins.", "2025-09-06T12:00:00Z"),
            episode("Dinner plan for saturday with the cousins.", "2025-09-06T12:05:00Z"),
            episode("Car inspection booked for monday morning.", "2025-09-06T13:00:00Z"),
        ];
        let space = SpaceId::new(SpaceKind::Shared, "household").unwrap();
        let mut config = ConsolidationConfig::default();
        config.tokens_per_day = 12;
        let rollup = build_rollup(&space, Period::Day, from, to, &episodes, &config);
        // The duplicate sentence must not crowd out the distinct one.
        assert!(rollup
            .highlights
            .iter()
            .any(|h| h.to_lowercase().contains("inspection")));
    }

    #[test]
    fn light_rewrite_cleans_fillers_and_punctuation() {
        assert_eq!(
            light_rewrite("note: sofia is going to sing on thursday"),
            "Sofia will sing on thursday."
        );
        assert_eq!(light_rewrite("  spaced   out  "), "Spaced out.");
    }

    #[test]
    fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RollupStore::open(dir.path()).unwrap();
        let (from, to) = window();
        let space = SpaceId::new(SpaceKind::Shared, "household").unwrap();
        let rollup = build_rollup(
            &space,
            Period::Day,
            from,
            to,
            &[episode("a note about things.", "2025-09-06T12:00:00Z")],
            &ConsolidationConfig::default(),
        );
        store.save(&rollup).unwrap();
        let loaded = store
            .load(Period::Day, &rollup.rollup_id, 1)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, rollup);
    }
}
