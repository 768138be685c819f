//! Service wiring and the public device API.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::info;
use uuid::Uuid;

use famos_actions::{ActionRunner, ReceiptStore, ToolRegistry};
use famos_bus::{DurableBus, SubscriptionHandle};
use famos_consolidation::{ConsolidationEngine, KgStore, PackStore, RollupStore};
use famos_hippocampus::{Hippocampus, InMemoryVectorIndex};
use famos_policy::{gate, FamilyPolicy, PolicyEngine, PolicySnapshot, RequestContext};
use famos_sync::{PassthroughCrypto, Replicator};
use famos_temporal::TemporalIndex;
use famos_types::payload::{ConsolidationTick, GatingContext, RecallQuery, TickKind, WriteAccepted};
use famos_types::{Band, Envelope, EventId, EventType, ProducerClock, SpaceId};
use famos_workflow::{Coordinator, ProspectiveScheduler, RunStore};
use famos_workspace::Workspace;

use crate::episodes::EpisodeStore;
use crate::handlers::{
    BusSink, ConsolidationHandler, HippocampusHandler, RecallHandler, TemporalHandler,
    WorkspaceHandler,
};
use crate::{
    FamilyConfig, RuntimeError, TOPIC_CONSOLIDATION, TOPIC_RECALL, TOPIC_WRITES,
};

/// A write offered to the substrate, before the gate has seen it.
#[derive(Debug, Clone)]
pub struct WriteIntent {
    /// Destination space.
    pub space_id: SpaceId,
    /// Writing family member.
    pub actor: String,
    /// Content.
    pub text: String,
    /// Sensitivity band.
    pub band: Band,
    /// Caller tags.
    pub tags: Vec<String>,
    /// Trace id propagated through the pipeline.
    pub trace_id: Option<String>,
    /// Content timestamp; the producer clock is used when absent. Backfill
    /// imports set this so temporal indexing reflects when the event
    /// happened, not when it was written.
    pub ts: Option<DateTime<Utc>>,
}

/// One running FamilyOS device. Owns every process-scoped service; create
/// with [`Runtime::open`], stop with [`Runtime::shutdown`].
pub struct Runtime {
    config: FamilyConfig,
    tz: Tz,
    clock: ProducerClock,
    bus: Arc<DurableBus>,
    policy: Arc<FamilyPolicy>,
    temporal: TemporalIndex,
    hippocampus: Arc<Hippocampus>,
    workspace: Arc<Workspace>,
    coordinator: Arc<Coordinator>,
    prospective: Arc<ProspectiveScheduler>,
    consolidation: Arc<ConsolidationEngine>,
    replicator: Arc<Replicator>,
    actions: Arc<ActionRunner>,
    episodes: EpisodeStore,
    subscriptions: Vec<SubscriptionHandle>,
    // Keep a handle so the database outlives every tree derived from it.
    _db: sled::Db,
}

impl Runtime {
    /// Open every store under the workspace root, wire the durable consumer
    /// groups, and return the running device.
    pub async fn open(
        config: FamilyConfig,
        policy_snapshot: PolicySnapshot,
        family_people: BTreeSet<String>,
    ) -> Result<Self, RuntimeError> {
        let tz: Tz = config
            .device_tz
            .parse()
            .map_err(|_| RuntimeError::UnknownTimezone(config.device_tz.clone()))?;
        let root = &config.workspace_root;
        std::fs::create_dir_all(root).map_err(|e| RuntimeError::Store(e.to_string()))?;

        let bus = Arc::new(
            DurableBus::open(root.join("bus"), config.bus.clone())
                .map_err(|e| RuntimeError::Store(e.to_string()))?,
        );
        let policy = Arc::new(FamilyPolicy::new(policy_snapshot));

        // One sled database backs every KV-shaped store.
        let db = sled::open(root.join("index.db")).map_err(|e| RuntimeError::Store(e.to_string()))?;
        let temporal = TemporalIndex::open(&db, config.temporal.clone())
            .map_err(|e| RuntimeError::Store(e.to_string()))?;
        let hippocampus = Arc::new(
            Hippocampus::new(
                &db,
                config.hippo.clone(),
                None,
                Arc::new(InMemoryVectorIndex::default()),
            )
            .map_err(|e| RuntimeError::Store(e.to_string()))?,
        );
        let episodes = EpisodeStore::open(&db)?;

        let sink = Arc::new(BusSink {
            bus: bus.clone(),
            device_id: config.device_id.clone(),
        });
        let workspace = Arc::new(Workspace::new(config.wm.clone(), sink));

        let run_store = RunStore::open(root.join("workflows"))
            .map_err(|e| RuntimeError::Store(e.to_string()))?;
        let coordinator = Arc::new(Coordinator::new(
            config.workflow.clone(),
            run_store,
            bus.clone(),
            policy.clone(),
        ));
        let prospective = Arc::new(
            ProspectiveScheduler::open(root.join("workflows"), bus.clone(), policy.clone())
                .map_err(|e| RuntimeError::Store(e.to_string()))?,
        );

        let consolidation = Arc::new(ConsolidationEngine::new(
            config.consolidation.clone(),
            Arc::new(episodes.clone()),
            RollupStore::open(root.join("consolidation").join("rollups"))
                .map_err(|e| RuntimeError::Store(e.to_string()))?,
            PackStore::open(root.join("consolidation").join("packs"))
                .map_err(|e| RuntimeError::Store(e.to_string()))?,
            KgStore::open(&db).map_err(|e| RuntimeError::Store(e.to_string()))?,
        ));

        let replicator = Arc::new(
            Replicator::open(
                root.join("crdt"),
                config.device_id.clone(),
                config.sync.clone(),
                Arc::new(PassthroughCrypto),
            )
            .map_err(|e| RuntimeError::Store(e.to_string()))?,
        );

        let actions = Arc::new(ActionRunner::new(
            config.action.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(
                ReceiptStore::open(root.join("receipts").join("receipts.log"))
                    .map_err(|e| RuntimeError::Store(e.to_string()))?,
            ),
            policy.clone(),
            bus.clone(),
        ));

        let mut runtime = Self {
            tz,
            clock: ProducerClock::new(),
            bus,
            policy,
            temporal,
            hippocampus,
            workspace,
            coordinator,
            prospective,
            consolidation,
            replicator,
            actions,
            episodes,
            subscriptions: Vec::new(),
            _db: db,
            config,
        };
        runtime.wire_subscribers(family_people)?;
        info!(root = %runtime.config.workspace_root.display(), "runtime open");
        Ok(runtime)
    }

    fn wire_subscribers(&mut self, people: BTreeSet<String>) -> Result<(), RuntimeError> {
        let subs = [
            self.bus.subscribe(
                "hippocampus",
                TOPIC_WRITES,
                Arc::new(HippocampusHandler {
                    hippo: self.hippocampus.clone(),
                    episodes: self.episodes.clone(),
                    engine: self.consolidation.clone(),
                    bus: self.bus.clone(),
                    people,
                    device_id: self.config.device_id.clone(),
                }),
            ),
            self.bus.subscribe(
                "temporal",
                TOPIC_WRITES,
                Arc::new(TemporalHandler {
                    index: self.temporal.clone(),
                    tz: self.tz,
                    bus: self.bus.clone(),
                    device_id: self.config.device_id.clone(),
                }),
            ),
            self.bus.subscribe(
                "workspace",
                TOPIC_WRITES,
                Arc::new(WorkspaceHandler {
                    workspace: self.workspace.clone(),
                    half_life_hours: self.config.temporal.half_life_hours,
                }),
            ),
            self.bus.subscribe(
                "recall",
                TOPIC_RECALL,
                Arc::new(RecallHandler {
                    temporal: self.temporal.clone(),
                    hippo: self.hippocampus.clone(),
                    bus: self.bus.clone(),
                    device_id: self.config.device_id.clone(),
                    dayparts: self.config.temporal.dayparts,
                }),
            ),
            self.bus.subscribe(
                "consolidation",
                TOPIC_CONSOLIDATION,
                Arc::new(ConsolidationHandler {
                    engine: self.consolidation.clone(),
                    episodes: self.episodes.clone(),
                    bus: self.bus.clone(),
                    device_id: self.config.device_id.clone(),
                }),
            ),
        ];
        for sub in subs {
            self.subscriptions
                .push(sub.map_err(|e| RuntimeError::Bus(e.to_string()))?);
        }
        Ok(())
    }

    //─────────────────────────────
    //  Public surface
    //─────────────────────────────

    /// The event bus (taps, DLQ inspection).
    pub fn bus(&self) -> &Arc<DurableBus> {
        &self.bus
    }

    /// The policy gate.
    pub fn policy(&self) -> &Arc<FamilyPolicy> {
        &self.policy
    }

    /// The workflow coordinator.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// The prospective scheduler.
    pub fn prospective(&self) -> &Arc<ProspectiveScheduler> {
        &self.prospective
    }

    /// The CRDT replicator.
    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// The action runner.
    pub fn actions(&self) -> &Arc<ActionRunner> {
        &self.actions
    }

    /// The workspace (snapshots, rehearsal).
    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Gate and durably publish one write. Returns the envelope id under
    /// which every downstream index will know the event.
    pub async fn submit_write(
        &self,
        intent: WriteIntent,
        ctx: &RequestContext,
    ) -> Result<EventId, RuntimeError> {
        let ts = intent.ts.unwrap_or_else(|| self.clock.now());
        let event_id = Uuid::new_v4().simple().to_string();
        let payload = WriteAccepted {
            event_id: event_id.clone(),
            ts,
            text: intent.text,
            tags: intent.tags,
        };
        let mut builder = Envelope::builder(
            TOPIC_WRITES,
            EventType::WriteAccepted,
            intent.space_id,
            intent.actor,
            self.config.device_id.clone(),
        )
        .band(intent.band)
        .policy_version(self.policy.version())
        .idempotency_key(event_id)
        .payload(&payload)
        .map_err(|e| RuntimeError::Envelope(e.to_string()))?;
        if let Some(trace) = intent.trace_id {
            builder = builder.trace_id(trace);
        }
        let envelope = builder
            .seal(ts)
            .map_err(|e| RuntimeError::Envelope(e.to_string()))?;

        // The gate rewrites the payload under redaction obligations; the
        // original text is never persisted anywhere durable.
        let envelope = gate(self.policy.as_ref(), envelope, ctx)?;
        let id = envelope.id;
        let space = envelope.space_id.clone();
        self.bus
            .publish(envelope)
            .await
            .map_err(|e| RuntimeError::Publish(e.to_string()))?;

        // Reflect the durable write into the replication DAG.
        self.replicator
            .append_local(
                &space,
                "envelope.append",
                serde_json::json!({ "envelope_id": id.simple().to_string() }),
            )
            .await
            .map_err(|e| RuntimeError::Store(e.to_string()))?;
        Ok(id)
    }

    /// Publish a `RECALL_QUERY`; the answer arrives as a `RECALL_RESULT`
    /// envelope on the recall topic carrying `correlation_id`.
    pub async fn submit_recall(
        &self,
        space_id: SpaceId,
        actor: &str,
        query: RecallQuery,
        correlation_id: &str,
    ) -> Result<(), RuntimeError> {
        let envelope = Envelope::builder(
            TOPIC_RECALL,
            EventType::RecallQuery,
            space_id,
            actor,
            self.config.device_id.clone(),
        )
        .correlation_id(correlation_id)
        .idempotency_key(format!("recall-q/{correlation_id}"))
        .payload(&query)
        .map_err(|e| RuntimeError::Envelope(e.to_string()))?
        .seal(self.clock.now())
        .map_err(|e| RuntimeError::Envelope(e.to_string()))?;
        self.bus
            .publish(envelope)
            .await
            .map_err(|e| RuntimeError::Publish(e.to_string()))?;
        Ok(())
    }

    /// Publish a consolidation tick.
    pub async fn trigger_consolidation(
        &self,
        kind: TickKind,
        space_id: SpaceId,
    ) -> Result<(), RuntimeError> {
        let budget_ms = match kind {
            TickKind::Idle => self.config.consolidation.idle_budget_ms,
            TickKind::Nightly | TickKind::Weekly => self.config.consolidation.nightly_budget_ms,
        };
        let payload = ConsolidationTick { kind, budget_ms };
        let envelope = Envelope::builder(
            TOPIC_CONSOLIDATION,
            EventType::ConsolidationTick,
            space_id,
            "scheduler",
            self.config.device_id.clone(),
        )
        .idempotency_key(format!(
            "tick/{:?}/{}",
            kind,
            self.clock.now().timestamp_micros()
        ))
        .payload(&payload)
        .map_err(|e| RuntimeError::Envelope(e.to_string()))?
        .seal(self.clock.now())
        .map_err(|e| RuntimeError::Envelope(e.to_string()))?;
        self.bus
            .publish(envelope)
            .await
            .map_err(|e| RuntimeError::Publish(e.to_string()))?;
        Ok(())
    }

    /// One maintenance tick: working-memory decay plus due prospective
    /// triggers. Production drives this from an interval task; tests drive
    /// it with a virtual clock.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        gating: &GatingContext,
        ctx: &RequestContext,
    ) -> Result<usize, RuntimeError> {
        self.workspace.tick(now).await;
        self.prospective
            .poll(now, gating, ctx)
            .await
            .map_err(|e| RuntimeError::Bus(e.to_string()))
    }

    /// Stop every dispatcher cleanly.
    pub async fn shutdown(self) {
        for sub in self.subscriptions {
            sub.shutdown().await;
        }
        info!("runtime stopped");
    }
}
