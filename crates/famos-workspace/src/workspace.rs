//! The global workspace: per-space working memories plus the debounced
//! broadcast of attention snapshots.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use famos_types::payload::{BroadcastSlot, WorkspaceBroadcast};
use famos_types::{EventId, SpaceId};

use crate::wm::{Candidate, WorkingMemory};
use crate::WmConfig;

/// Where workspace snapshots go. The runtime wires this to the event bus
/// (`WORKSPACE_BROADCAST` envelopes); tests use [`ChannelSink`].
#[async_trait]
pub trait BroadcastSink: Send + Sync {
    /// Deliver one snapshot.
    async fn broadcast(&self, snapshot: WorkspaceBroadcast) -> anyhow::Result<()>;
}

/// Sink backed by a tokio broadcast channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: broadcast::Sender<WorkspaceBroadcast>,
}

impl ChannelSink {
    /// Create a sink and keep the sender for subscription.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceBroadcast> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl BroadcastSink for ChannelSink {
    async fn broadcast(&self, snapshot: WorkspaceBroadcast) -> anyhow::Result<()> {
        // Lagging receivers are a live-stream concern, not an error.
        let _ = self.tx.send(snapshot);
        Ok(())
    }
}

/// Multi-space workspace service.
pub struct Workspace {
    config: WmConfig,
    spaces: DashMap<SpaceId, WorkingMemory>,
    last_broadcast: DashMap<SpaceId, DateTime<Utc>>,
    dirty: DashMap<SpaceId, ()>,
    sink: Arc<dyn BroadcastSink>,
}

impl Workspace {
    /// New workspace publishing through `sink`.
    pub fn new(config: WmConfig, sink: Arc<dyn BroadcastSink>) -> Self {
        Self {
            config,
            spaces: DashMap::new(),
            last_broadcast: DashMap::new(),
            dirty: DashMap::new(),
            sink,
        }
    }

    /// Offer candidates to a space and broadcast if the debounce allows.
    pub async fn admit(&self, space: &SpaceId, candidates: Vec<Candidate>, now: DateTime<Utc>) {
        let changed = {
            let mut wm = self
                .spaces
                .entry(space.clone())
                .or_insert_with(|| WorkingMemory::new(self.config.clone()));
            wm.admit_batch(candidates, now)
        };
        if changed {
            self.dirty.insert(space.clone(), ());
            self.maybe_broadcast(space, now).await;
        }
    }

    /// Rehearsal bump for a held event.
    pub async fn rehearse(&self, space: &SpaceId, event_id: &EventId, now: DateTime<Utc>) {
        let changed = self
            .spaces
            .get_mut(space)
            .map(|mut wm| wm.rehearse(event_id, now))
            .unwrap_or(false);
        if changed {
            self.dirty.insert(space.clone(), ());
            self.maybe_broadcast(space, now).await;
        }
    }

    /// Decay pass across every space; flushes any broadcasts whose debounce
    /// window has elapsed (latest-wins per space).
    pub async fn tick(&self, now: DateTime<Utc>) {
        let spaces: Vec<SpaceId> = self.spaces.iter().map(|e| e.key().clone()).collect();
        for space in spaces {
            let changed = self
                .spaces
                .get_mut(&space)
                .map(|mut wm| wm.tick(now))
                .unwrap_or(false);
            if changed {
                self.dirty.insert(space.clone(), ());
            }
            if self.dirty.contains_key(&space) {
                self.maybe_broadcast(&space, now).await;
            }
        }
    }

    /// Current snapshot of a space, strongest slot first.
    pub fn snapshot(&self, space: &SpaceId) -> WorkspaceBroadcast {
        let slots = self
            .spaces
            .get(space)
            .map(|wm| {
                wm.slots()
                    .iter()
                    .map(|s| BroadcastSlot {
                        event_id: s.event_id.simple().to_string(),
                        weight: s.weight,
                        summary: s.summary.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        WorkspaceBroadcast {
            space_id: space.clone(),
            slots,
        }
    }

    /// Number of live slots in a space.
    pub fn slot_count(&self, space: &SpaceId) -> usize {
        self.spaces.get(space).map(|wm| wm.slots().len()).unwrap_or(0)
    }

    async fn maybe_broadcast(&self, space: &SpaceId, now: DateTime<Utc>) {
        let debounce = Duration::milliseconds(self.config.debounce_ms as i64);
        let due = self
            .last_broadcast
            .get(space)
            .map(|last| now - *last >= debounce)
            .unwrap_or(true);
        if !due {
            // Stay dirty; the next tick flushes the latest snapshot.
            return;
        }
        let snapshot = self.snapshot(space);
        self.last_broadcast.insert(space.clone(), now);
        self.dirty.remove(space);
        debug!(space = %space, slots = snapshot.slots.len(), "workspace broadcast");
        if let Err(e) = self.sink.broadcast(snapshot).await {
            warn!(space = %space, error = %e, "workspace broadcast failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Features;
    use famos_types::SpaceKind;
    use uuid::Uuid;

    fn space() -> SpaceId {
        SpaceId::new(SpaceKind::Shared, "household").unwrap()
    }

    fn candidate(recency: f64) -> Candidate {
        Candidate {
            event_id: Uuid::new_v4(),
            features: Features {
                recency,
                ..Default::default()
            },
            summary: "note".into(),
            code: None,
        }
    }

    #[tokio::test]
    async fn admission_broadcasts_a_snapshot() {
        let sink = Arc::new(ChannelSink::new(16));
        let mut rx = sink.subscribe();
        let ws = Workspace::new(WmConfig::default(), sink);
        ws.admit(&space(), vec![candidate(0.9)], Utc::now()).await;

        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.space_id, space());
        assert_eq!(snapshot.slots.len(), 1);
    }

    #[tokio::test]
    async fn broadcasts_are_debounced_within_the_window() {
        let sink = Arc::new(ChannelSink::new(16));
        let mut rx = sink.subscribe();
        let ws = Workspace::new(WmConfig::default(), sink);
        let now = Utc::now();

        ws.admit(&space(), vec![candidate(0.9)], now).await;
        // 10ms later: inside the 100ms window, suppressed.
        ws.admit(&space(), vec![candidate(0.8)], now + Duration::milliseconds(10))
            .await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // Past the window a tick flushes the suppressed snapshot.
        ws.tick(now + Duration::milliseconds(150)).await;
        let flushed = rx.try_recv().unwrap();
        assert_eq!(flushed.slots.len(), 2);
    }

    #[tokio::test]
    async fn slot_cap_holds_across_spaces() {
        let sink = Arc::new(ChannelSink::new(16));
        let ws = Workspace::new(WmConfig::default(), sink);
        let other = SpaceId::new(SpaceKind::Personal, "alice").unwrap();
        let now = Utc::now();
        ws.admit(&space(), (0..30).map(|_| candidate(0.5)).collect(), now)
            .await;
        ws.admit(&other, (0..30).map(|_| candidate(0.5)).collect(), now)
            .await;
        assert!(ws.slot_count(&space()) <= 8);
        assert!(ws.slot_count(&other) <= 8);
    }
}
