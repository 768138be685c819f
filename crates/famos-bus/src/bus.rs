//! The durable bus: topics, consumer groups, dispatch, retry, DLQ.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use famos_types::Envelope;

use crate::offsets::{GroupOffsets, InFlight, OffsetStore};
use crate::wal::{topic_dlq_path, topic_wal_path, Wal};
use crate::{BusConfig, BusError, DlqRecord, EventHandler, HandlerOutcome, PublishError};

/// Idle poll fallback so deadline-based redelivery makes progress even
/// without a publish notification.
const IDLE_POLL: Duration = Duration::from_millis(200);

//─────────────────────────────
//  Internal state
//─────────────────────────────

#[derive(Debug)]
struct TopicState {
    wal: Mutex<Wal>,
    dlq: Mutex<Wal>,
    notify: Notify,
    tap: broadcast::Sender<Envelope>,
}

#[derive(Debug)]
struct GroupState {
    offsets: std::sync::Mutex<GroupOffsets>,
}

impl GroupState {
    fn snapshot(&self) -> GroupOffsets {
        self.offsets
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut GroupOffsets) -> R) -> R {
        let mut guard = self.offsets.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

//─────────────────────────────
//  DurableBus
//─────────────────────────────

/// Process-scoped bus service. Owns every topic WAL under its root
/// directory; pass it around as `Arc<DurableBus>`.
#[derive(Debug)]
pub struct DurableBus {
    root: PathBuf,
    config: BusConfig,
    topics: DashMap<String, Arc<TopicState>>,
    groups: DashMap<(String, String), Arc<GroupState>>,
    offset_store: Arc<OffsetStore>,
}

impl DurableBus {
    /// Open a bus rooted at `root` (usually `workspace/bus/`).
    pub fn open(root: impl Into<PathBuf>, config: BusConfig) -> Result<Self, BusError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let offset_store = Arc::new(OffsetStore::new(&root)?);
        Ok(Self {
            root,
            config,
            topics: DashMap::new(),
            groups: DashMap::new(),
            offset_store,
        })
    }

    /// The bus root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn topic_state(&self, topic: &str) -> Result<Arc<TopicState>, BusError> {
        if let Some(state) = self.topics.get(topic) {
            return Ok(state.clone());
        }
        let wal = Wal::open(topic_wal_path(&self.root, topic))?;
        let dlq = Wal::open(topic_dlq_path(&self.root, topic))?;
        let (tap, _) = broadcast::channel(self.config.tap_capacity);
        let state = Arc::new(TopicState {
            wal: Mutex::new(wal),
            dlq: Mutex::new(dlq),
            notify: Notify::new(),
            tap,
        });
        Ok(self
            .topics
            .entry(topic.to_string())
            .or_insert(state)
            .clone())
    }

    fn group_state(&self, group: &str, topic: &str) -> Result<Arc<GroupState>, BusError> {
        let key = (group.to_string(), topic.to_string());
        if let Some(state) = self.groups.get(&key) {
            return Ok(state.clone());
        }
        let offsets = self.offset_store.load(group, topic)?;
        let state = Arc::new(GroupState {
            offsets: std::sync::Mutex::new(offsets),
        });
        Ok(self.groups.entry(key).or_insert(state).clone())
    }

    /// Durably append an envelope to its topic WAL.
    ///
    /// Fans out by waking every group dispatcher on the topic and mirrors the
    /// envelope onto the live tap. Refuses with back-pressure when the
    /// slowest group on the topic lags beyond the high watermark.
    pub async fn publish(&self, envelope: Envelope) -> Result<u64, PublishError> {
        envelope
            .validate()
            .map_err(|e| PublishError::Invalid(e.to_string()))?;
        let topic = envelope.topic.clone();
        let state = self
            .topic_state(&topic)
            .map_err(|e| io_publish_error(e))?;

        // Back-pressure: check the slowest durable group on this topic.
        let wal_len = state.wal.lock().await.len();
        let mut worst_lag = 0u64;
        for entry in self.groups.iter() {
            if entry.key().1 == topic {
                let next = entry.value().with(|g| g.next());
                worst_lag = worst_lag.max(wal_len.saturating_sub(next));
            }
        }
        if worst_lag > self.config.lag_high_watermark {
            return Err(PublishError::BackPressure {
                topic,
                lag: worst_lag,
            });
        }

        let body = rmp_serde::to_vec_named(&envelope)
            .map_err(|e| PublishError::Invalid(e.to_string()))?;
        let offset = {
            let mut wal = state.wal.lock().await;
            wal.append(&body).map_err(|e| io_publish_error(e))?
        };
        debug!(topic = %envelope.topic, offset, id = %envelope.id, "published");
        let _ = state.tap.send(envelope);
        state.notify.notify_waiters();
        Ok(offset)
    }

    /// Subscribe to live traffic on a topic. Non-durable; lagging receivers
    /// drop events. Use [`DurableBus::subscribe`] for at-least-once delivery.
    pub fn tap(&self, topic: &str) -> Result<broadcast::Receiver<Envelope>, BusError> {
        Ok(self.topic_state(topic)?.tap.subscribe())
    }

    /// Create or resume a durable consumer group on a topic.
    ///
    /// Delivery resumes from `committed + 1`; an in-flight record persisted
    /// before a crash is redelivered once its deadline has expired. One
    /// dispatcher task serializes deliveries, which is what makes per-group
    /// ordering strict FIFO.
    pub fn subscribe(
        self: &Arc<Self>,
        group: &str,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        let topic_state = self.topic_state(topic)?;
        let group_state = self.group_state(group, topic)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = DispatcherCtx {
            group: group.to_string(),
            topic: topic.to_string(),
            topic_state,
            group_state,
            offset_store: self.offset_store.clone(),
            config: self.config.clone(),
            handler,
            shutdown_rx,
        };
        info!(group, topic, "consumer group subscribed");
        let join = tokio::spawn(run_dispatcher(ctx));
        Ok(SubscriptionHandle {
            group: group.to_string(),
            topic: topic.to_string(),
            shutdown_tx,
            join,
        })
    }

    /// Advance a group's committed offset. Idempotent and monotonic.
    pub fn commit(&self, group: &str, topic: &str, offset: u64) -> Result<(), BusError> {
        let state = self.group_state(group, topic)?;
        state.with(|g| g.commit(offset));
        self.offset_store.store(group, topic, &state.snapshot())
    }

    /// Rewind a group to re-read from `from_offset` (recovery / debugging).
    pub fn replay(&self, group: &str, topic: &str, from_offset: u64) -> Result<(), BusError> {
        let state = self.group_state(group, topic)?;
        state.with(|g| {
            g.committed = from_offset.checked_sub(1);
            g.in_flight.clear();
        });
        self.offset_store.store(group, topic, &state.snapshot())?;
        if let Some(topic_state) = self.topics.get(topic) {
            topic_state.notify.notify_waiters();
        }
        info!(group, topic, from_offset, "group replay requested");
        Ok(())
    }

    /// Number of records on a topic WAL.
    pub async fn topic_len(&self, topic: &str) -> Result<u64, BusError> {
        Ok(self.topic_state(topic)?.wal.lock().await.len())
    }

    /// Read dead-lettered records for a topic.
    pub async fn read_dlq(
        &self,
        topic: &str,
        from: u64,
        max: usize,
    ) -> Result<Vec<(u64, DlqRecord)>, BusError> {
        let state = self.topic_state(topic)?;
        let dlq = state.dlq.lock().await;
        let raw = dlq.read_from(from, max)?;
        raw.into_iter()
            .map(|(offset, bytes)| {
                rmp_serde::from_slice(&bytes)
                    .map(|r| (offset, r))
                    .map_err(|e| BusError::Codec(e.to_string()))
            })
            .collect()
    }

    /// Current committed offset for a group, if any.
    pub fn committed(&self, group: &str, topic: &str) -> Result<Option<u64>, BusError> {
        Ok(self.group_state(group, topic)?.with(|g| g.committed))
    }
}

fn io_publish_error(e: BusError) -> PublishError {
    match e {
        BusError::Io(io) => PublishError::Io(io),
        other => PublishError::Invalid(other.to_string()),
    }
}

//─────────────────────────────
//  Subscription handle
//─────────────────────────────

/// Handle to a running dispatcher; dropping it leaves the task running,
/// call [`SubscriptionHandle::shutdown`] for a clean stop.
#[derive(Debug)]
pub struct SubscriptionHandle {
    /// Consumer group name.
    pub group: String,
    /// Subscribed topic.
    pub topic: String,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Stop the dispatcher after its current delivery completes.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }

    /// Abort the dispatcher immediately, simulating a crash. The committed
    /// offset stays wherever the last ack left it.
    pub fn abort(self) {
        self.join.abort();
    }
}

//─────────────────────────────
//  Dispatcher
//─────────────────────────────

struct DispatcherCtx {
    group: String,
    topic: String,
    topic_state: Arc<TopicState>,
    group_state: Arc<GroupState>,
    offset_store: Arc<OffsetStore>,
    config: BusConfig,
    handler: Arc<dyn EventHandler>,
    shutdown_rx: watch::Receiver<bool>,
}

async fn run_dispatcher(mut ctx: DispatcherCtx) {
    loop {
        if *ctx.shutdown_rx.borrow() {
            debug!(group = %ctx.group, topic = %ctx.topic, "dispatcher stopping");
            return;
        }
        // Clone the Arc so the notified future borrows a local, leaving
        // `ctx` free for the delivery path. Created before the emptiness
        // check to avoid a missed-wakeup race.
        let topic_state = ctx.topic_state.clone();
        let notified = topic_state.notify.notified();
        let next = ctx.group_state.with(|g| g.next());
        let record = {
            let wal = ctx.topic_state.wal.lock().await;
            wal.read_from(next, 1)
        };
        match record {
            Ok(records) if records.is_empty() => {
                tokio::select! {
                    _ = notified => {}
                    _ = ctx.shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
            Ok(mut records) => {
                let (offset, bytes) = records.remove(0);
                deliver(&mut ctx, offset, &bytes).await;
            }
            Err(e) => {
                error!(group = %ctx.group, topic = %ctx.topic, error = %e, "wal read failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn deliver(ctx: &mut DispatcherCtx, offset: u64, bytes: &[u8]) {
    let envelope: Envelope = match rmp_serde::from_slice(bytes) {
        Ok(env) => env,
        Err(e) => {
            // Undecodable record: we cannot dead-letter what we cannot read.
            // Log loudly and skip so the group is not wedged forever.
            error!(
                group = %ctx.group,
                topic = %ctx.topic,
                offset,
                error = %e,
                "skipping undecodable record"
            );
            commit_and_persist(ctx, offset);
            return;
        }
    };

    let timeout_ms = envelope
        .qos
        .timeout_ms
        .unwrap_or(ctx.config.default_timeout_ms);
    let max_retries = envelope
        .qos
        .max_retries
        .unwrap_or(ctx.config.max_retries);
    let deadline = Duration::from_millis(timeout_ms);

    // Resume the attempt counter from a persisted in-flight record and honour
    // its deadline: redelivery only becomes eligible once it expires.
    let prior = ctx.group_state.with(|g| {
        g.in_flight
            .iter()
            .find(|f| f.offset == offset)
            .cloned()
    });
    let mut attempt = prior.as_ref().map(|f| f.attempt).unwrap_or(0);
    if let Some(prior) = prior {
        let now = Utc::now();
        if prior.deadline > now {
            let wait = (prior.deadline - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
        }
    }

    loop {
        attempt += 1;
        let in_flight = InFlight {
            offset,
            attempt,
            deadline: Utc::now() + chrono::Duration::milliseconds(timeout_ms as i64),
        };
        ctx.group_state.with(|g| {
            g.in_flight.retain(|f| f.offset != offset);
            g.in_flight.push(in_flight);
        });
        persist(ctx);

        let outcome =
            match tokio::time::timeout(deadline, ctx.handler.handle(envelope.clone(), deadline))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => HandlerOutcome::retry("handler deadline exceeded"),
            };

        match outcome {
            HandlerOutcome::Ack => {
                commit_and_persist(ctx, offset);
                return;
            }
            HandlerOutcome::Nack { retryable, reason } => {
                let retries_done = attempt.saturating_sub(1);
                if !retryable || retries_done >= max_retries {
                    dead_letter(ctx, envelope, attempt, &reason).await;
                    commit_and_persist(ctx, offset);
                    return;
                }
                let delay = backoff_with_jitter(
                    ctx.config.base_backoff_ms,
                    ctx.config.max_backoff_ms,
                    retries_done,
                );
                warn!(
                    group = %ctx.group,
                    topic = %ctx.topic,
                    offset,
                    attempt,
                    %reason,
                    delay_ms = delay.as_millis() as u64,
                    "delivery nacked, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.shutdown_rx.changed() => return,
                }
            }
        }
    }
}

fn commit_and_persist(ctx: &DispatcherCtx, offset: u64) {
    ctx.group_state.with(|g| g.commit(offset));
    persist(ctx);
}

fn persist(ctx: &DispatcherCtx) {
    let snapshot = ctx.group_state.snapshot();
    if let Err(e) = ctx.offset_store.store(&ctx.group, &ctx.topic, &snapshot) {
        error!(group = %ctx.group, topic = %ctx.topic, error = %e, "offset persist failed");
    }
}

async fn dead_letter(ctx: &DispatcherCtx, envelope: Envelope, attempts: u32, reason: &str) {
    warn!(
        group = %ctx.group,
        topic = %ctx.topic,
        id = %envelope.id,
        attempts,
        %reason,
        "dead-lettering envelope"
    );
    let record = DlqRecord {
        envelope,
        group: ctx.group.clone(),
        reason: reason.to_string(),
        attempts,
        failed_at: Utc::now(),
    };
    match rmp_serde::to_vec_named(&record) {
        Ok(bytes) => {
            let mut dlq = ctx.topic_state.dlq.lock().await;
            if let Err(e) = dlq.append(&bytes) {
                error!(topic = %ctx.topic, error = %e, "dlq append failed");
            }
        }
        Err(e) => error!(topic = %ctx.topic, error = %e, "dlq encode failed"),
    }
}

/// Exponential backoff with uniform jitter in `[delay/2, delay]`.
fn backoff_with_jitter(base_ms: u64, max_ms: u64, retries_done: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << retries_done.min(20)).min(max_ms);
    let jittered = rand::thread_rng().gen_range(exp / 2..=exp.max(1));
    Duration::from_millis(jittered)
}
