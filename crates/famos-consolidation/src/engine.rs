//! The tick-driven consolidation pass.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Datelike, Duration, Utc};
use tracing::{debug, info, warn};

use famos_types::payload::TickKind;
use famos_types::SpaceId;

use crate::compact::{compact, CompactionOutcome};
use crate::kg::{project_relations, KgStore};
use crate::pack::PackStore;
use crate::recon::ReconAction;
use crate::rollup::{build_rollup, Period, Rollup, RollupStore};
use crate::{ConsolidationConfig, ConsolidationError, EpisodeSource};

/// What one pass accomplished; published as `CONSOLIDATION_DONE`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassSummary {
    /// Duplicate groups merged.
    pub groups_merged: usize,
    /// Rollups written.
    pub rollups_written: usize,
    /// KG triples appended.
    pub triples_appended: usize,
    /// True when the budget expired before all stages ran.
    pub budget_exhausted: bool,
}

/// The consolidation engine. One instance per device, driven by
/// `CONSOLIDATION_TICK` envelopes from its durable consumer group.
pub struct ConsolidationEngine {
    config: ConsolidationConfig,
    source: Arc<dyn EpisodeSource>,
    rollups: RollupStore,
    packs: PackStore,
    kg: KgStore,
    recon_log: std::sync::Mutex<Vec<ReconAction>>,
}

impl ConsolidationEngine {
    /// Build the engine over its stores.
    pub fn new(
        config: ConsolidationConfig,
        source: Arc<dyn EpisodeSource>,
        rollups: RollupStore,
        packs: PackStore,
        kg: KgStore,
    ) -> Self {
        Self {
            config,
            source,
            rollups,
            packs,
            kg,
            recon_log: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// The KG store (recall pipelines read it).
    pub fn kg(&self) -> &KgStore {
        &self.kg
    }

    /// Audit records written by reconsolidation so far.
    pub fn recon_actions(&self) -> Vec<ReconAction> {
        self.recon_log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Record a reconsolidation (used by the runtime when late evidence
    /// arrives) and persist the updated rollup.
    pub fn apply_recon(
        &self,
        updated: Rollup,
        action: ReconAction,
    ) -> Result<(), ConsolidationError> {
        self.rollups.save(&updated)?;
        self.recon_log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(action);
        Ok(())
    }

    /// Run one pass for a space within the tick's budget.
    ///
    /// Idle ticks only compact; nightly ticks compact and write the day
    /// rollup; weekly ticks add the week rollup. Every stage checks the
    /// remaining budget first, so a small budget degrades to fewer stages
    /// rather than a blown deadline.
    pub fn run_pass(
        &self,
        space: &SpaceId,
        kind: TickKind,
        now: DateTime<Utc>,
        budget_ms: u64,
    ) -> Result<PassSummary, ConsolidationError> {
        let started = Instant::now();
        let budget = std::time::Duration::from_millis(budget_ms);
        let mut summary = PassSummary::default();

        let window_start = match kind {
            TickKind::Idle | TickKind::Nightly => now - Duration::days(1),
            TickKind::Weekly => now - Duration::days(7),
        };
        let episodes = self
            .source
            .episodes_in(space, window_start, now)
            .map_err(|e| ConsolidationError::Source(e.to_string()))?;
        if episodes.is_empty() {
            return Ok(summary);
        }

        // Stage 1: compaction.
        let compaction = compact(&episodes, &self.config);
        summary.groups_merged = compaction.groups.len();
        self.pack_duplicates(&episodes, &compaction, now)?;

        if started.elapsed() >= budget {
            summary.budget_exhausted = true;
            warn!(space = %space, "consolidation budget spent during compaction");
            return Ok(summary);
        }

        // Stage 2: rollups.
        if matches!(kind, TickKind::Nightly | TickKind::Weekly) {
            let day_from = now - Duration::days(1);
            let day_episodes: Vec<_> = episodes
                .iter()
                .filter(|e| e.ts >= day_from)
                .cloned()
                .collect();
            if !day_episodes.is_empty() {
                let rollup = build_rollup(
                    space,
                    Period::Day,
                    day_from,
                    now,
                    &day_episodes,
                    &self.config,
                );
                summary.triples_appended += self.project_rollup(&rollup)?;
                self.rollups.save(&rollup)?;
                summary.rollups_written += 1;
            }
        }
        if kind == TickKind::Weekly && started.elapsed() < budget {
            let rollup = build_rollup(
                space,
                Period::Week,
                window_start,
                now,
                &episodes,
                &self.config,
            );
            summary.triples_appended += self.project_rollup(&rollup)?;
            self.rollups.save(&rollup)?;
            summary.rollups_written += 1;
        }

        if started.elapsed() >= budget {
            summary.budget_exhausted = true;
        }
        info!(
            space = %space,
            ?kind,
            groups = summary.groups_merged,
            rollups = summary.rollups_written,
            triples = summary.triples_appended,
            "consolidation pass done"
        );
        Ok(summary)
    }

    /// Stage 3: KG projection from a rollup's text.
    fn project_rollup(&self, rollup: &Rollup) -> Result<usize, ConsolidationError> {
        let mut appended = 0;
        for triple in project_relations(&rollup.summary_text, rollup.to) {
            if self.kg.append(&triple)? {
                appended += 1;
            }
        }
        debug!(rollup = %rollup.rollup_id, appended, "kg projection");
        Ok(appended)
    }

    fn pack_duplicates(
        &self,
        episodes: &[crate::Episode],
        compaction: &CompactionOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), ConsolidationError> {
        let period = format!("{:04}-{:02}", now.year(), now.month());
        for group in &compaction.groups {
            for duplicate in &group.duplicates {
                if let Some(episode) = episodes.iter().find(|e| e.event_id == *duplicate) {
                    self.packs.pack(&period, episode.text.as_bytes())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Episode;
    use chrono::TimeZone;
    use famos_types::{Band, SpaceKind};
    use uuid::Uuid;

    struct FixedSource {
        episodes: Vec<Episode>,
    }

    impl EpisodeSource for FixedSource {
        fn episodes_in(
            &self,
            space: &SpaceId,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Episode>> {
            Ok(self
                .episodes
                .iter()
                .filter(|e| e.space_id == *space && e.ts >= from && e.ts < to)
                .cloned()
                .collect())
        }
    }

    fn space() -> SpaceId {
        SpaceId::new(SpaceKind::Shared, "household").unwrap()
    }

    fn episode(text: &str, ts: DateTime<Utc>) -> Episode {
        Episode {
            event_id: Uuid::new_v4(),
            space_id: space(),
            ts,
            text: text.to_string(),
            author: "alice".into(),
            band: Band::Green,
            affect_confidence: 0.5,
        }
    }

    fn engine(episodes: Vec<Episode>) -> (tempfile::TempDir, ConsolidationEngine) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("kg")).unwrap();
        let engine = ConsolidationEngine::new(
            ConsolidationConfig::default(),
            Arc::new(FixedSource { episodes }),
            RollupStore::open(dir.path().join("rollups")).unwrap(),
            PackStore::open(dir.path().join("packs")).unwrap(),
            KgStore::open(&db).unwrap(),
        );
        (dir, engine)
    }

    #[test]
    fn nightly_pass_compacts_rolls_up_and_projects() {
        let now = Utc.with_ymd_and_hms(2025, 9, 7, 2, 0, 0).unwrap();
        let base = "Grocery run after work, remember milk eggs and the bread Sofia likes. \
                    Pharmacy closes at seven so go there first.";
        let episodes = vec![
            episode(base, now - Duration::hours(10)),
            episode(
                &format!("{base} Also pick up the dry cleaning."),
                now - Duration::hours(9),
            ),
            episode("Alice called the dentist about Thursday.", now - Duration::hours(5)),
        ];
        let (_dir, engine) = engine(episodes);

        let summary = engine
            .run_pass(&space(), TickKind::Nightly, now, 30_000)
            .unwrap();
        assert_eq!(summary.groups_merged, 1);
        assert_eq!(summary.rollups_written, 1);
        assert!(summary.triples_appended >= 1);
        assert!(!summary.budget_exhausted);
        assert!(!engine.kg().is_empty());
    }

    #[test]
    fn weekly_pass_writes_day_and_week_rollups() {
        let now = Utc.with_ymd_and_hms(2025, 9, 7, 3, 0, 0).unwrap();
        let episodes = vec![
            episode("Monday swim practice resumed.", now - Duration::days(5)),
            episode("Bought paint for the hallway.", now - Duration::hours(6)),
        ];
        let (_dir, engine) = engine(episodes);
        let summary = engine
            .run_pass(&space(), TickKind::Weekly, now, 30_000)
            .unwrap();
        assert_eq!(summary.rollups_written, 2);
    }

    #[test]
    fn empty_space_is_a_no_op() {
        let (_dir, engine) = engine(vec![]);
        let summary = engine
            .run_pass(&space(), TickKind::Idle, Utc::now(), 2_000)
            .unwrap();
        assert_eq!(summary, PassSummary::default());
    }
}
