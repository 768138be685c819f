//! Two-device convergence, durability, and E2EE behaviour.

use std::collections::HashMap;
use std::sync::Arc;

use famos_sync::{
    ChaChaGroupCrypto, MemoryTransport, PassthroughCrypto, Replicator, SyncConfig,
};
use famos_types::{SpaceId, SpaceKind};

fn space() -> SpaceId {
    SpaceId::new(SpaceKind::Shared, "household").unwrap()
}

fn replicator(dir: &std::path::Path, author: &str) -> Arc<Replicator> {
    Arc::new(
        Replicator::open(
            dir,
            author,
            SyncConfig::default(),
            Arc::new(PassthroughCrypto),
        )
        .unwrap(),
    )
}

async fn run_session(initiator: Arc<Replicator>, responder: Arc<Replicator>) {
    let (a_end, b_end) = MemoryTransport::pair();
    let server = tokio::spawn(async move { responder.serve_once(&b_end).await });
    initiator.sync_once(&a_end).await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn two_peers_converge_after_one_round_each() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = replicator(dir_a.path(), "alice-phone");
    let b = replicator(dir_b.path(), "bob-tablet");

    for n in 0..2 {
        a.append_local(&space(), "envelope.append", serde_json::json!({ "a": n }))
            .await
            .unwrap();
        b.append_local(&space(), "envelope.append", serde_json::json!({ "b": n }))
            .await
            .unwrap();
    }

    run_session(a.clone(), b.clone()).await;
    run_session(b.clone(), a.clone()).await;

    let ids_a = a.op_ids(&space()).await.unwrap();
    let ids_b = b.op_ids(&space()).await.unwrap();
    assert_eq!(ids_a.len(), 4);
    assert_eq!(ids_a, ids_b, "op sets must be identical");
    assert_eq!(
        a.heads(&space()).await.unwrap(),
        b.heads(&space()).await.unwrap()
    );

    // Lamport values are monotone within each author.
    for replicator in [&a, &b] {
        let ops = replicator.total_order(&space()).await.unwrap();
        for author in ["alice-phone", "bob-tablet"] {
            let lamports: Vec<u64> = ops
                .iter()
                .filter(|op| op.author_id == author)
                .map(|op| op.lamport)
                .collect();
            let mut sorted = lamports.clone();
            sorted.sort_unstable();
            assert_eq!(lamports, sorted, "{author} lamports not monotone");
        }
    }
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = replicator(dir_a.path(), "a");
    let b = replicator(dir_b.path(), "b");

    a.append_local(&space(), "envelope.append", serde_json::json!({ "x": 1 }))
        .await
        .unwrap();

    run_session(a.clone(), b.clone()).await;
    run_session(a.clone(), b.clone()).await;
    run_session(b.clone(), a.clone()).await;

    assert_eq!(a.op_ids(&space()).await.unwrap().len(), 1);
    assert_eq!(b.op_ids(&space()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn ops_survive_restart_from_the_log() {
    let dir = tempfile::tempdir().unwrap();
    {
        let a = replicator(dir.path(), "a");
        a.append_local(&space(), "envelope.append", serde_json::json!({ "x": 1 }))
            .await
            .unwrap();
        a.append_local(&space(), "envelope.append", serde_json::json!({ "x": 2 }))
            .await
            .unwrap();
    }
    let a = replicator(dir.path(), "a");
    let ids = a.op_ids(&space()).await.unwrap();
    assert_eq!(ids.len(), 2);
    // The reloaded clock continues past persisted ops.
    let op = a
        .append_local(&space(), "envelope.append", serde_json::json!({ "x": 3 }))
        .await
        .unwrap();
    assert_eq!(op.lamport, 3);
}

#[tokio::test]
async fn matching_group_keys_sync_encrypted_spaces() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let mut keys = HashMap::new();
    keys.insert(space(), [42u8; 32]);
    let a = Arc::new(
        Replicator::open(
            dir_a.path(),
            "a",
            SyncConfig::default(),
            Arc::new(ChaChaGroupCrypto::new(keys.clone())),
        )
        .unwrap(),
    );
    let b = Arc::new(
        Replicator::open(
            dir_b.path(),
            "b",
            SyncConfig::default(),
            Arc::new(ChaChaGroupCrypto::new(keys)),
        )
        .unwrap(),
    );

    a.append_local(&space(), "envelope.append", serde_json::json!({ "secret": true }))
        .await
        .unwrap();
    run_session(a.clone(), b.clone()).await;
    assert_eq!(b.op_ids(&space()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn mismatched_keys_drop_frames_with_audit_not_corruption() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let mut keys_a = HashMap::new();
    keys_a.insert(space(), [1u8; 32]);
    let mut keys_b = HashMap::new();
    keys_b.insert(space(), [2u8; 32]);
    let a = Arc::new(
        Replicator::open(
            dir_a.path(),
            "a",
            SyncConfig::default(),
            Arc::new(ChaChaGroupCrypto::new(keys_a)),
        )
        .unwrap(),
    );
    let b = Arc::new(
        Replicator::open(
            dir_b.path(),
            "b",
            SyncConfig::default(),
            Arc::new(ChaChaGroupCrypto::new(keys_b)),
        )
        .unwrap(),
    );

    a.append_local(&space(), "envelope.append", serde_json::json!({ "secret": true }))
        .await
        .unwrap();

    let (a_end, b_end) = MemoryTransport::pair();
    let b2 = b.clone();
    let server = tokio::spawn(async move { b2.serve_once(&b_end).await });
    a.sync_once(&a_end).await.unwrap();
    let report = server.await.unwrap().unwrap();

    assert_eq!(report.received_ops, 0);
    assert!(report.dropped_frames >= 1);
    assert!(b.op_ids(&space()).await.unwrap().is_empty());
}

#[tokio::test]
async fn inventory_chunks_respect_the_configured_size() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let mut config = SyncConfig::default();
    config.inv_chunk = 8;
    let a = Arc::new(
        Replicator::open(dir_a.path(), "a", config.clone(), Arc::new(PassthroughCrypto)).unwrap(),
    );
    let b = Arc::new(
        Replicator::open(dir_b.path(), "b", config, Arc::new(PassthroughCrypto)).unwrap(),
    );

    for n in 0..30 {
        a.append_local(&space(), "envelope.append", serde_json::json!({ "n": n }))
            .await
            .unwrap();
    }
    run_session(a.clone(), b.clone()).await;
    assert_eq!(b.op_ids(&space()).await.unwrap().len(), 30);
}
