use std::sync::Arc;

use stash::cache::{BlobKind, Snapshot, StoreLayout};
use stash::core::ManualClock;
use tempfile::tempdir;

#[path = "../common/mod.rs"]
mod common;

use common::{config, open, put, RequestKey, ResponseMeta};

#[tokio::test]
async fn test_entries_survive_reopen() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let clock = Arc::new(ManualClock::default());

    let (ids, size) = {
        let engine = open(config(dir.path()), clock.clone()).await;
        let a = put(&engine, "https://example.com/a", "a", b"alpha").await;
        let b = put(&engine, "https://example.com/b", "b", b"beta").await;
        engine.flush().await?;
        ((a, b), engine.current_size_bytes().await)
    };

    let engine = open(config(dir.path()), clock.clone()).await;
    assert_eq!(engine.entry_count().await, 2);
    assert_eq!(engine.current_size_bytes().await, size);

    let entry = engine
        .lookup(&RequestKey::get("https://example.com/b"))
        .await?
        .expect("entry restored from snapshot");
    assert_eq!(entry.id, ids.1);
    assert_eq!(entry.value, Some(ResponseMeta::ok("b")));

    // Ids keep counting after a restart
    let draft = engine.reserve_entry(RequestKey::get("c")).await;
    assert!(draft.id() > ids.1);
    Ok(())
}

#[tokio::test]
async fn test_missing_key_blob_dropped_on_reopen() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let clock = Arc::new(ManualClock::default());
    let layout = StoreLayout::new(dir.path());

    let gone = {
        let engine = open(config(dir.path()), clock.clone()).await;
        let gone = put(&engine, "gone", "x", b"body").await;
        put(&engine, "kept", "y", b"body").await;
        engine.flush().await?;
        gone
    };
    std::fs::remove_file(layout.blob_path(gone, BlobKind::Key))?;

    let engine = open(config(dir.path()), clock).await;
    assert_eq!(engine.entry_count().await, 1);
    assert!(engine.lookup(&RequestKey::get("kept")).await?.is_some());

    let expected: u64 = {
        let entry = engine.lookup(&RequestKey::get("kept")).await?.unwrap();
        let id = entry.id;
        [
            layout.resource_path(id),
            layout.blob_path(id, BlobKind::Key),
            layout.blob_path(id, BlobKind::Value),
        ]
        .iter()
        .map(|path| std::fs::metadata(path).map(|m| m.len()).unwrap_or(0))
        .sum()
    };
    assert_eq!(engine.current_size_bytes().await, expected);
    Ok(())
}

#[tokio::test]
async fn test_corrupt_snapshot_starts_empty() -> anyhow::Result<()> {
    let dir = tempdir()?;
    std::fs::write(dir.path().join("cache.index"), b"not a snapshot")?;

    let engine = open(config(dir.path()), Arc::new(ManualClock::default())).await;
    assert_eq!(engine.entry_count().await, 0);

    // Still usable, and the next flush replaces the bad file
    put(&engine, "a", "e", b"body").await;
    engine.flush().await?;
    let snapshot = Snapshot::read(&dir.path().join("cache.index")).await?;
    assert_eq!(snapshot.count, 1);
    Ok(())
}

#[tokio::test]
async fn test_stale_staging_files_removed_on_open() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let staging = dir.path().join("staging");
    std::fs::create_dir_all(&staging)?;
    std::fs::write(staging.join("42"), b"half written")?;

    let _engine = open(config(dir.path()), Arc::new(ManualClock::default())).await;
    assert!(staging.is_dir());
    assert_eq!(std::fs::read_dir(&staging)?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_snapshot_is_stable_while_writing() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let engine = Arc::new(open(config(dir.path()), Arc::new(ManualClock::default())).await);

    let writer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for i in 0..20 {
                put(&engine, &format!("https://example.com/{}", i), "e", b"body").await;
            }
        })
    };
    for _ in 0..10 {
        engine.flush().await?;
        let snapshot = Snapshot::read(&dir.path().join("cache.index")).await?;
        assert_eq!(snapshot.entries.len() as u64, snapshot.count);
        assert_eq!(snapshot.order.len() as u64, snapshot.count);
    }
    writer.await?;

    engine.flush().await?;
    let snapshot = Snapshot::read(&dir.path().join("cache.index")).await?;
    assert_eq!(snapshot.count, 20);
    Ok(())
}
