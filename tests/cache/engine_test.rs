use std::sync::Arc;

use stash::cache::{BlobKind, StoreLayout};
use stash::core::ManualClock;
use tempfile::tempdir;

#[path = "../common/mod.rs"]
mod common;

use common::{config, entry_files, open, put, RequestKey, ResponseMeta};

#[tokio::test]
async fn test_round_trip() {
    let dir = tempdir().unwrap();
    let engine = open(config(dir.path()), Arc::new(ManualClock::default())).await;

    let id = put(&engine, "https://example.com/", "v1", b"hello world").await;

    let entry = engine
        .lookup(&RequestKey::get("https://example.com/"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.id, id);
    assert_eq!(entry.key, RequestKey::get("https://example.com/"));
    assert_eq!(entry.value, Some(ResponseMeta::ok("v1")));
    assert_eq!(entry.stored_size, 11);
    assert_eq!(tokio::fs::read(&entry.resource_path).await.unwrap(), b"hello world");

    assert_eq!(engine.entry_count().await, 1);
    assert!(engine.current_size_bytes().await > 11);
}

#[tokio::test]
async fn test_overwrite_replaces_entry() {
    let dir = tempdir().unwrap();
    let engine = open(config(dir.path()), Arc::new(ManualClock::default())).await;
    let layout = StoreLayout::new(dir.path());

    let first = put(&engine, "https://example.com/a", "old", b"old body").await;
    let second = put(&engine, "https://example.com/a", "new", b"new body!").await;
    assert_ne!(first, second);

    let entry = engine
        .lookup(&RequestKey::get("https://example.com/a"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.id, second);
    assert_eq!(entry.value, Some(ResponseMeta::ok("new")));
    assert_eq!(engine.entry_count().await, 1);

    // Files of the replaced entry are gone
    assert!(!layout.resource_path(first).exists());
    assert!(!layout.blob_path(first, BlobKind::Key).exists());
    assert!(!layout.blob_path(first, BlobKind::Value).exists());
}

#[tokio::test]
async fn test_clear_is_idempotent() {
    let dir = tempdir().unwrap();
    let engine = open(config(dir.path()), Arc::new(ManualClock::default())).await;

    for i in 0..5 {
        put(&engine, &format!("https://example.com/{}", i), "e", b"body").await;
    }
    assert_eq!(entry_files(dir.path()).len(), 15);

    engine.clear().await.unwrap();
    assert_eq!(engine.entry_count().await, 0);
    assert_eq!(engine.current_size_bytes().await, 0);
    assert!(entry_files(dir.path()).is_empty());

    engine.clear().await.unwrap();
    assert_eq!(engine.entry_count().await, 0);
    assert!(dir.path().join("staging").is_dir());
}

#[tokio::test]
async fn test_missing_value_blob_is_evicted() {
    let dir = tempdir().unwrap();
    let engine = open(config(dir.path()), Arc::new(ManualClock::default())).await;
    let layout = StoreLayout::new(dir.path());

    let broken = put(&engine, "https://example.com/broken", "x", b"body").await;
    put(&engine, "https://example.com/fine", "y", b"body").await;
    let before = engine.current_size_bytes().await;

    std::fs::remove_file(layout.blob_path(broken, BlobKind::Value)).unwrap();

    let entries = engine.iterate_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, RequestKey::get("https://example.com/fine"));

    let hit = engine
        .lookup(&RequestKey::get("https://example.com/broken"))
        .await
        .unwrap();
    assert!(hit.is_none());
    assert_eq!(engine.entry_count().await, 1);
    assert!(engine.current_size_bytes().await < before);
    assert!(!layout.resource_path(broken).exists());
}

#[tokio::test]
async fn test_garbled_key_blob_is_evicted() {
    let dir = tempdir().unwrap();
    let engine = open(config(dir.path()), Arc::new(ManualClock::default())).await;
    let layout = StoreLayout::new(dir.path());

    let id = put(&engine, "https://example.com/", "x", b"body").await;
    std::fs::write(layout.blob_path(id, BlobKind::Key), b"\x01garbage").unwrap();

    let hit = engine.lookup(&RequestKey::get("https://example.com/")).await.unwrap();
    assert!(hit.is_none());
    assert_eq!(engine.entry_count().await, 0);
}

#[tokio::test]
async fn test_iterate_in_insertion_order() {
    let dir = tempdir().unwrap();
    let engine = open(config(dir.path()), Arc::new(ManualClock::default())).await;

    let urls = ["c", "a", "b"];
    for url in urls {
        put(&engine, url, url, url.as_bytes()).await;
    }

    let keys: Vec<_> = engine
        .iterate_entries()
        .await
        .into_iter()
        .map(|entry| entry.key.url)
        .collect();
    assert_eq!(keys, urls);
}

#[tokio::test]
async fn test_update_keeps_identity() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());
    let engine = open(config(dir.path()), clock.clone()).await;

    let id = put(&engine, "https://example.com/old", "v1", b"body").await;
    let expiry = chrono::Utc::now() + chrono::Duration::hours(5);

    engine
        .update(
            &RequestKey::get("https://example.com/old"),
            RequestKey::get("https://example.com/new"),
            Some(ResponseMeta::ok("v2")),
            expiry,
            4,
        )
        .await
        .unwrap();

    assert!(engine
        .lookup(&RequestKey::get("https://example.com/old"))
        .await
        .unwrap()
        .is_none());
    let entry = engine
        .lookup(&RequestKey::get("https://example.com/new"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.id, id);
    assert_eq!(entry.value, Some(ResponseMeta::ok("v2")));
    assert_eq!(entry.expires_at, expiry);
}

#[tokio::test]
async fn test_concurrent_writers() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(open(config(dir.path()), Arc::new(ManualClock::default())).await);

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let url = format!("https://example.com/{}", i % 4);
            put(&engine, &url, &i.to_string(), b"body").await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(engine.entry_count().await, 4);
    for i in 0..4 {
        let url = format!("https://example.com/{}", i);
        assert!(engine.lookup(&RequestKey::get(&url)).await.unwrap().is_some());
    }
    assert_eq!(entry_files(dir.path()).len(), 12);
}
