use std::sync::Arc;
use std::time::Duration;

use stash::core::ManualClock;
use tempfile::tempdir;

#[path = "../common/mod.rs"]
mod common;

use common::{config, entry_files, open, put, RequestKey};

#[tokio::test]
async fn test_expired_entries_are_swept() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());
    let engine = open(config(dir.path()), clock.clone()).await;

    put(&engine, "old", "e", b"body").await;
    clock.advance(chrono::Duration::seconds(30));
    put(&engine, "young", "e", b"body").await;
    clock.advance(chrono::Duration::seconds(45));

    // Still visible until the janitor runs
    assert!(engine.lookup(&RequestKey::get("old")).await.unwrap().is_some());

    let stats = engine.run_cleanup().await;
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.evicted, 0);
    assert_eq!(stats.failures, 0);
    assert!(stats.persisted);

    assert!(engine.lookup(&RequestKey::get("old")).await.unwrap().is_none());
    assert!(engine.lookup(&RequestKey::get("young")).await.unwrap().is_some());
    assert_eq!(entry_files(dir.path()).len(), 3);
}

#[tokio::test]
async fn test_size_budget_evicts_oldest_first() {
    let dir = tempdir().unwrap();
    let engine = open(config(dir.path()), Arc::new(ManualClock::default())).await;

    let body = vec![7u8; 1000];
    for url in ["first", "second", "third"] {
        put(&engine, url, "e", &body).await;
    }
    let total = engine.current_size_bytes().await;
    let per_entry = total / 3;

    let mut limited = engine.config().await;
    limited.max_size_bytes = per_entry * 2 + per_entry / 2;
    engine.configure(limited.clone()).await.unwrap();

    let stats = engine.run_cleanup().await;
    assert_eq!(stats.evicted, 1);
    assert!(stats.persisted);
    assert!(engine.current_size_bytes().await <= limited.max_size_bytes);

    // Lookups do not refresh position
    assert!(engine.lookup(&RequestKey::get("second")).await.unwrap().is_some());
    let keys: Vec<_> = engine
        .iterate_entries()
        .await
        .into_iter()
        .map(|entry| entry.key.url)
        .collect();
    assert_eq!(keys, ["second", "third"]);
}

#[tokio::test]
async fn test_cleanup_without_changes() {
    let dir = tempdir().unwrap();
    let engine = open(config(dir.path()), Arc::new(ManualClock::default())).await;

    put(&engine, "a", "e", b"body").await;
    assert!(engine.run_cleanup().await.persisted);

    // Nothing removed, nothing dirty
    let stats = engine.run_cleanup().await;
    assert_eq!(stats.removed(), 0);
    assert!(!stats.persisted);
}

#[tokio::test]
async fn test_janitor_lifecycle() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());
    let mut cfg = config(dir.path());
    cfg.cleanup_interval_seconds = 1;
    let engine = open(cfg, clock.clone()).await;

    put(&engine, "short-lived", "e", b"body").await;
    engine.start().await;
    assert!(engine.is_running().await);

    clock.advance(chrono::Duration::minutes(5));
    let mut swept = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if engine.entry_count().await == 0 {
            swept = true;
            break;
        }
    }
    assert!(swept);

    // Returns promptly even though the janitor is sleeping
    tokio::time::timeout(Duration::from_secs(5), engine.stop())
        .await
        .unwrap();
    assert!(!engine.is_running().await);
    assert!(dir.path().join("cache.index").exists());
}
