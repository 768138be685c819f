//! Reconsolidation: folding late, high-signal evidence into rollups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rollup::{light_rewrite, Rollup};
use crate::Episode;

/// What a reconsolidation pass did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconOutcome {
    /// Evidence was local to the period: the rollup was patched in place.
    Patched,
    /// Evidence arrived after the period closed: a new version was produced.
    Versioned {
        /// The new version number.
        new_version: u32,
        /// Highlights added relative to the prior version.
        diff: Vec<String>,
    },
}

/// Audit record written for every reconsolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconAction {
    /// Affected rollup.
    pub rollup_id: Uuid,
    /// What happened.
    pub outcome: ReconOutcome,
    /// Event ids of the evidence folded in.
    pub evidence: Vec<Uuid>,
    /// When the pass ran.
    pub at: DateTime<Utc>,
}

/// Fold late evidence into a rollup.
///
/// Evidence timestamped inside the rollup window patches in place (same
/// version); evidence from outside produces a v+1 rollup carrying a diff.
/// The caller persists the returned rollup and appends the audit record.
pub fn reconsolidate(
    rollup: &Rollup,
    evidence: &[Episode],
    now: DateTime<Utc>,
) -> Option<(Rollup, ReconAction)> {
    let fresh: Vec<&Episode> = evidence
        .iter()
        .filter(|e| !rollup.provenance.contains(&e.event_id))
        .collect();
    if fresh.is_empty() {
        return None;
    }

    let local = fresh
        .iter()
        .all(|e| e.ts >= rollup.from && e.ts < rollup.to);

    let mut updated = rollup.clone();
    let mut added = Vec::new();
    for episode in &fresh {
        for sentence in episode.text.split(['.', '!', '?']) {
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                let rewritten = light_rewrite(sentence);
                if !updated.highlights.contains(&rewritten) {
                    added.push(rewritten.clone());
                    updated.highlights.push(rewritten);
                }
            }
        }
        updated.provenance.insert(episode.event_id);
    }

    let outcome = if local {
        ReconOutcome::Patched
    } else {
        updated.version += 1;
        ReconOutcome::Versioned {
            new_version: updated.version,
            diff: added.clone(),
        }
    };

    // Re-render the summary body from the updated highlight set.
    let mut summary = String::new();
    let mut lines = rollup.summary_text.lines();
    for line in lines.by_ref() {
        summary.push_str(line);
        summary.push('\n');
        if line.trim().is_empty() && summary.contains('→') {
            break;
        }
    }
    for highlight in &updated.highlights {
        summary.push_str(&format!("- {highlight}\n"));
    }
    summary.push_str("\n## Provenance\n\n");
    for event_id in &updated.provenance {
        summary.push_str(&format!("- event:{}\n", event_id.simple()));
    }
    updated.summary_text = summary;

    let action = ReconAction {
        rollup_id: rollup.rollup_id,
        outcome: outcome.clone(),
        evidence: fresh.iter().map(|e| e.event_id).collect(),
        at: now,
    };
    tracing::info!(
        rollup = %rollup.rollup_id,
        ?outcome,
        evidence = action.evidence.len(),
        "reconsolidated"
    );
    Some((updated, action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::{build_rollup, Period};
    use crate::ConsolidationConfig;
    use famos_types::{Band, SpaceId, SpaceKind};

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

    fn base_rollup() -> Rollup {
        build_rollup(
            &SpaceId::new(SpaceKind::Shared, "household").unwrap(),
            Period::Day,
            "2025-09-06T00:00:00Z".parse().unwrap(),
            "2025-09-07T00:00:00Z".parse().unwrap(),
            &[episode("Dentist appointment went fine.", "2025-09-06T10:00:00Z")],
            &ConsolidationConfig::default(),
        )
    }

    #[test]
    fn local_evidence_patches_in_place() {
        let rollup = base_rollup();
        let late = episode("The receipt arrived for the dentist.", "2025-09-06T22:00:00Z");
        let (updated, action) =
            reconsolidate(&rollup, &[late], Utc::now()).expect("evidence should apply");
        assert_eq!(action.outcome, ReconOutcome::Patched);
        assert_eq!(updated.version, rollup.version);
        assert!(updated.highlights.len() > rollup.highlights.len());
        assert!(updated.provenance.len() > rollup.provenance.len());
    }

    #[test]
    fn out_of_window_evidence_produces_a_new_version_with_diff() {
        let rollup = base_rollup();
        let late = episode("A reply came two days later.", "2025-09-08T09:00:00Z");
        let (updated, action) =
            reconsolidate(&rollup, &[late], Utc::now()).expect("evidence should apply");
        match action.outcome {
            ReconOutcome::Versioned { new_version, diff } => {
                assert_eq!(new_version, 2);
                assert_eq!(diff, vec!["A reply came two days later.".to_string()]);
            }
            other => panic!("expected versioned, got {other:?}"),
        }
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn known_evidence_is_a_no_op() {
        let rollup = base_rollup();
        let known_id = *rollup.provenance.iter().next().unwrap();
        let mut known = episode("Dentist appointment went fine.", "2025-09-06T10:00:00Z");
        known.event_id = known_id;
        assert!(reconsolidate(&rollup, &[known], Utc::now()).is_none());
    }
}
