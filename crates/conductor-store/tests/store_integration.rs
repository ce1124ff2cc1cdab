#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_store::{
    CheckpointEntry, CheckpointLog, FileCheckpointLog, FileSnapshotStore, SnapshotStore,
};
use serde_json::json;
use std::sync::Arc;

/// Helper: create a log and snapshot store side by side in a temp directory.
async fn temp_stores() -> (FileCheckpointLog, FileSnapshotStore, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let log = FileCheckpointLog::new(tmp.path().join("log")).await.unwrap();
    let snapshots = FileSnapshotStore::new(tmp.path().join("snapshots"))
        .await
        .unwrap();
    (log, snapshots, tmp)
}

// ---------------------------------------------------------------------------
// Checkpoint log
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_appends_are_all_replayed() {
    let (log, _snapshots, _tmp) = temp_stores().await;
    let log = Arc::new(log);

    let mut handles = Vec::new();
    for i in 0..20u64 {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            log.append(CheckpointEntry::new("events", i, "task:queued", json!({"i": i})))
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let entries = log.replay("events").await.unwrap();
    assert_eq!(entries.len(), 20);
    let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_trait_object_usage() {
    let (log, _snapshots, _tmp) = temp_stores().await;
    let log: Arc<dyn CheckpointLog> = Arc::new(log);
    log.append(CheckpointEntry::new("events", 1, "started", json!(null)))
        .await
        .unwrap();
    assert_eq!(log.streams().await.unwrap(), vec!["events"]);
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_snapshot_lifecycle() {
    let (_log, store, _tmp) = temp_stores().await;

    assert!(store.load("queue").await.unwrap().is_none());

    store.save("queue", &json!({"pending": 3})).await.unwrap();
    store.save("stats", &json!({"completed": 7})).await.unwrap();
    assert_eq!(store.list().await.unwrap(), vec!["queue", "stats"]);

    let queue = store.load("queue").await.unwrap().unwrap();
    assert_eq!(queue["pending"], 3);

    store.delete("queue").await.unwrap();
    assert!(store.load("queue").await.unwrap().is_none());
    // Deleting again is a no-op.
    store.delete("queue").await.unwrap();
    assert_eq!(store.list().await.unwrap(), vec!["stats"]);
}
