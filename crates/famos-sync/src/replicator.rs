//! The replicator: space state, push-pull sessions, backoff.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use smallvec::SmallVec;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use famos_types::SpaceId;

use crate::crypto::CryptoProvider;
use crate::dag::SpaceDag;
use crate::log::OpLog;
use crate::op::{Op, OpId};
use crate::protocol::SyncMessage;
use crate::transport::Transport;
use crate::{SyncConfig, SyncError};

struct SpaceState {
    dag: SpaceDag,
    log: OpLog,
}

/// Outcome of one sync session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Ops shipped to the peer.
    pub sent_ops: usize,
    /// Ops received and applied.
    pub received_ops: usize,
    /// Frames dropped because they failed to unwrap.
    pub dropped_frames: usize,
}

/// Per-device replicator owning every space DAG under its root directory.
pub struct Replicator {
    root: PathBuf,
    author: String,
    config: SyncConfig,
    crypto: Arc<dyn CryptoProvider>,
    spaces: DashMap<SpaceId, Arc<Mutex<SpaceState>>>,
}

impl Replicator {
    /// Open a replicator rooted at `root` (usually `workspace/crdt/`),
    /// loading any persisted op logs lazily as spaces are touched.
    pub fn open(
        root: impl Into<PathBuf>,
        author: impl Into<String>,
        config: SyncConfig,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self, SyncError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let replicator = Self {
            root,
            author: author.into(),
            config,
            crypto,
            spaces: DashMap::new(),
        };
        replicator.load_existing()?;
        Ok(replicator)
    }

    fn load_existing(&self) -> Result<(), SyncError> {
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Directory names are `kind__name`.
            let Some((kind, space_name)) = name.split_once("__") else {
                continue;
            };
            if let Ok(space) = SpaceId::parse(&format!("{kind}:{space_name}")) {
                self.space_state(&space)?;
            }
        }
        Ok(())
    }

    fn space_state(&self, space: &SpaceId) -> Result<Arc<Mutex<SpaceState>>, SyncError> {
        if let Some(state) = self.spaces.get(space) {
            return Ok(state.clone());
        }
        let path = self.root.join(space.dir_name()).join("ops.log");
        let (log, ops) = OpLog::open(path)?;
        let mut dag = SpaceDag::new();
        for op in ops {
            dag.add_op(op);
        }
        let state = Arc::new(Mutex::new(SpaceState { dag, log }));
        Ok(self.spaces.entry(space.clone()).or_insert(state).clone())
    }

    /// Create and persist a local op with the current heads as parents.
    pub async fn append_local(
        &self,
        space: &SpaceId,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Op, SyncError> {
        let state = self.space_state(space)?;
        let mut state = state.lock().await;
        let lamport = state.dag.next_lamport();
        let parents: SmallVec<[OpId; 4]> = state.dag.heads().into_iter().collect();
        let op = Op::new(
            self.author.clone(),
            lamport,
            chrono::Utc::now(),
            parents,
            kind,
            payload,
            space.clone(),
        );
        state.log.append(&op)?;
        state.dag.add_op(op.clone());
        debug!(space = %space, op = %op.op_id, lamport, "local op appended");
        Ok(op)
    }

    /// Apply a remote op; duplicates are accepted silently.
    pub async fn add_op(&self, op: Op) -> Result<bool, SyncError> {
        let state = self.space_state(&op.space_id)?;
        let mut state = state.lock().await;
        if state.dag.contains(&op.op_id) {
            return Ok(false);
        }
        state.log.append(&op)?;
        state.dag.add_op(op);
        Ok(true)
    }

    /// Op id set of a space.
    pub async fn op_ids(&self, space: &SpaceId) -> Result<BTreeSet<OpId>, SyncError> {
        Ok(self.space_state(space)?.lock().await.dag.id_set())
    }

    /// Heads of a space.
    pub async fn heads(&self, space: &SpaceId) -> Result<Vec<OpId>, SyncError> {
        Ok(self.space_state(space)?.lock().await.dag.heads())
    }

    /// Ops of a space in total `(lamport, op_id)` order.
    pub async fn total_order(&self, space: &SpaceId) -> Result<Vec<Op>, SyncError> {
        let state = self.space_state(space)?;
        let state = state.lock().await;
        Ok(state.dag.total_order().into_iter().cloned().collect())
    }

    async fn counts(&self) -> std::collections::BTreeMap<String, u64> {
        let mut counts = std::collections::BTreeMap::new();
        for entry in self.spaces.iter() {
            let len = entry.value().lock().await.dag.len() as u64;
            if len > 0 {
                counts.insert(entry.key().to_string(), len);
            }
        }
        counts
    }

    //─────────────────────────────
    //  Sessions
    //─────────────────────────────

    /// Drive one push-pull session as the initiator.
    pub async fn sync_once(&self, transport: &dyn Transport) -> Result<SyncReport, SyncError> {
        let my_counts = self.counts().await;
        send(transport, &SyncMessage::Hello {
            counts: my_counts.clone(),
        })
        .await?;
        let peer_counts = match recv(transport).await? {
            SyncMessage::Ack { counts } => counts,
            other => return Err(protocol_violation("ACK", &other)),
        };

        let spaces = session_spaces(&my_counts, &peer_counts);
        let mut report = SyncReport::default();
        for space in spaces {
            // Push, then pull; the responder mirrors this order.
            self.push_space(transport, &space, &mut report).await?;
            self.pull_space(transport, &space, &mut report).await?;
        }
        info!(
            sent = report.sent_ops,
            received = report.received_ops,
            dropped = report.dropped_frames,
            "sync session complete (initiator)"
        );
        Ok(report)
    }

    /// Serve one push-pull session as the responder.
    pub async fn serve_once(&self, transport: &dyn Transport) -> Result<SyncReport, SyncError> {
        let peer_counts = match recv(transport).await? {
            SyncMessage::Hello { counts } => counts,
            other => return Err(protocol_violation("HELLO", &other)),
        };
        let my_counts = self.counts().await;
        send(transport, &SyncMessage::Ack {
            counts: my_counts.clone(),
        })
        .await?;

        let spaces = session_spaces(&my_counts, &peer_counts);
        let mut report = SyncReport::default();
        for space in spaces {
            // Mirror of the initiator: pull its push, then push back.
            self.pull_space(transport, &space, &mut report).await?;
            self.push_space(transport, &space, &mut report).await?;
        }
        info!(
            sent = report.sent_ops,
            received = report.received_ops,
            dropped = report.dropped_frames,
            "sync session complete (responder)"
        );
        Ok(report)
    }

    /// [`Replicator::sync_once`] with jittered exponential backoff on
    /// transport errors.
    pub async fn sync_with_backoff(
        &self,
        transport: &dyn Transport,
    ) -> Result<SyncReport, SyncError> {
        let (min_ms, max_ms) = self.config.backoff_ms;
        let mut last_err = None;
        for attempt in 0..self.config.max_attempts {
            match self.sync_once(transport).await {
                Ok(report) => return Ok(report),
                Err(SyncError::Transport(e)) => {
                    let exp = min_ms.saturating_mul(1u64 << attempt.min(10)).min(max_ms);
                    let delay = rand::thread_rng().gen_range(exp / 2..=exp.max(1));
                    warn!(attempt, error = %e, delay_ms = delay, "sync failed, backing off");
                    last_err = Some(SyncError::Transport(e));
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or_else(|| SyncError::Transport("no attempts made".into())))
    }

    /// Send our inventory in chunks; ship whatever the peer asks for.
    async fn push_space(
        &self,
        transport: &dyn Transport,
        space: &SpaceId,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let ids: Vec<OpId> = {
            let state = self.space_state(space)?;
            let state = state.lock().await;
            state.dag.op_ids()
        };
        let chunk_size = self.config.inv_chunk.max(1);
        let chunks: Vec<&[OpId]> = if ids.is_empty() {
            vec![&[]]
        } else {
            ids.chunks(chunk_size).collect()
        };
        let n_chunks = chunks.len();
        for (idx, chunk) in chunks.into_iter().enumerate() {
            send(transport, &SyncMessage::Inv {
                space: space.to_string(),
                ids: chunk.to_vec(),
                last: idx + 1 == n_chunks,
            })
            .await?;
            let wanted = match recv(transport).await? {
                SyncMessage::Get { ids, .. } => ids,
                other => return Err(protocol_violation("GET", &other)),
            };
            let ops: Vec<Op> = {
                let state = self.space_state(space)?;
                let state = state.lock().await;
                wanted
                    .iter()
                    .filter_map(|id| state.dag.get(id).cloned())
                    .collect()
            };
            report.sent_ops += ops.len();
            let plain =
                rmp_serde::to_vec_named(&ops).map_err(|e| SyncError::Codec(e.to_string()))?;
            let wrapped = self.crypto.wrap(space, &plain)?;
            send(transport, &SyncMessage::Ops {
                space: space.to_string(),
                wrapped,
            })
            .await?;
        }
        Ok(())
    }

    /// Receive the peer's inventory chunks; request and apply what we lack.
    async fn pull_space(
        &self,
        transport: &dyn Transport,
        space: &SpaceId,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        loop {
            let (ids, last) = match recv(transport).await? {
                SyncMessage::Inv { ids, last, .. } => (ids, last),
                other => return Err(protocol_violation("INV", &other)),
            };
            let missing = {
                let state = self.space_state(space)?;
                let state = state.lock().await;
                state.dag.missing_from(&ids)
            };
            send(transport, &SyncMessage::Get {
                space: space.to_string(),
                ids: missing,
            })
            .await?;
            let wrapped = match recv(transport).await? {
                SyncMessage::Ops { wrapped, .. } => wrapped,
                other => return Err(protocol_violation("OPS", &other)),
            };
            match self.crypto.unwrap(space, &wrapped) {
                Ok(plain) => {
                    let ops: Vec<Op> = rmp_serde::from_slice(&plain)
                        .map_err(|e| SyncError::Codec(e.to_string()))?;
                    for op in ops {
                        if self.add_op(op).await? {
                            report.received_ops += 1;
                        }
                    }
                }
                Err(SyncError::Decryption { space }) => {
                    // Unknown signer or wrong key: drop with audit, keep the
                    // session alive.
                    warn!(%space, "audit: dropped undecryptable ops frame");
                    report.dropped_frames += 1;
                }
                Err(other) => return Err(other),
            }
            if last {
                return Ok(());
            }
        }
    }
}

fn session_spaces(
    mine: &std::collections::BTreeMap<String, u64>,
    theirs: &std::collections::BTreeMap<String, u64>,
) -> Vec<SpaceId> {
    let mut names: BTreeSet<&String> = mine.keys().collect();
    names.extend(theirs.keys());
    names
        .into_iter()
        .filter_map(|name| SpaceId::parse(name).ok())
        .collect()
}

async fn send(transport: &dyn Transport, msg: &SyncMessage) -> Result<(), SyncError> {
    transport.send(msg.encode()?).await
}

async fn recv(transport: &dyn Transport) -> Result<SyncMessage, SyncError> {
    SyncMessage::decode(&transport.recv().await?)
}

fn protocol_violation(expected: &str, got: &SyncMessage) -> SyncError {
    SyncError::Protocol(format!("expected {expected}, got {got:?}"))
}
