//! Durable snapshot of the whole index.
//!
//! The snapshot is a best-effort durability aid, not a write-ahead log: a
//! crash loses the mutations made since the last write, and blobs written in
//! that window become unreferenced files.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use stash_core::error::{StashError, StashResult};
use stash_core::CompressionLevel;

use crate::blob::{BlobHandle, Fingerprint};
use crate::compression;
use crate::index::{EntryRecord, Index};
use crate::layout::{BlobKind, EntryId, StoreLayout};

const SNAPSHOT_VERSION: u32 = 1;

/// Where a blob lives and what it contains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub id: EntryId,
    pub kind: BlobKind,
    pub fingerprint: Fingerprint,
    pub size: u64,
}

impl<T> From<&BlobHandle<T>> for BlobDescriptor {
    fn from(handle: &BlobHandle<T>) -> Self {
        Self {
            id: handle.id(),
            kind: handle.kind(),
            fingerprint: handle.fingerprint(),
            size: handle.size(),
        }
    }
}

impl BlobDescriptor {
    fn into_handle<T>(self, expected: BlobKind) -> StashResult<BlobHandle<T>> {
        if self.kind != expected {
            return Err(StashError::corrupt(format!(
                "Blob {} is a {} blob, expected {}",
                self.id, self.kind, expected
            )));
        }
        Ok(BlobHandle::new(self.id, self.kind, self.fingerprint, self.size))
    }
}

/// Persisted form of an entry record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordData {
    pub id: EntryId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub stored_size: u64,
    pub key_size: u64,
    pub value: Option<BlobDescriptor>,
    pub value_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: BlobDescriptor,
    pub record: RecordData,
}

/// Everything needed to rebuild an [`Index`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub next_id: EntryId,
    pub total_bytes: u64,
    pub count: u64,
    pub entries: Vec<SnapshotEntry>,
    /// Entry ids in insertion order
    pub order: Vec<EntryId>,
}

impl Snapshot {
    /// Copy the state of `index`
    pub fn capture<K, V>(index: &Index<K, V>) -> Self {
        let entries: Vec<SnapshotEntry> = index
            .iter()
            .map(|record| SnapshotEntry {
                key: BlobDescriptor::from(&record.key),
                record: RecordData {
                    id: record.id,
                    created_at: record.created_at,
                    expires_at: record.expires_at,
                    stored_size: record.stored_size,
                    key_size: record.key_size(),
                    value: record.value.as_ref().map(BlobDescriptor::from),
                    value_size: record.value_size(),
                },
            })
            .collect();
        let order = entries.iter().map(|e| e.record.id).collect();

        Self {
            version: SNAPSHOT_VERSION,
            next_id: index.next_id(),
            total_bytes: index.total_bytes(),
            count: entries.len() as u64,
            entries,
            order,
        }
    }

    pub fn encode(&self, level: CompressionLevel) -> StashResult<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        compression::compress(&json, level)
    }

    pub fn decode(bytes: &[u8]) -> StashResult<Self> {
        let json = compression::decompress(bytes)?;
        let snapshot: Snapshot = serde_json::from_slice(&json)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StashError::corrupt(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.count != snapshot.entries.len() as u64 {
            return Err(StashError::corrupt(format!(
                "Snapshot declares {} entries but holds {}",
                snapshot.count,
                snapshot.entries.len()
            )));
        }
        Ok(snapshot)
    }

    /// Write the snapshot atomically using a temporary file
    pub async fn write(&self, layout: &StoreLayout, level: CompressionLevel) -> StashResult<()> {
        let data = self.encode(level)?;

        let tmp = layout.snapshot_tmp_path();
        fs::write(&tmp, &data)
            .await
            .map_err(|e| StashError::io_at(e, &tmp))?;

        let path = layout.snapshot_path();
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StashError::io_at(e, &path))?;

        debug!(entries = self.count, bytes = data.len(), "Wrote index snapshot");
        Ok(())
    }

    pub async fn read(path: &Path) -> StashResult<Self> {
        let data = fs::read(path)
            .await
            .map_err(|e| StashError::io_at(e, path))?;
        Self::decode(&data)
    }

    /// Rebuild an index, dropping records whose key blob is gone.
    ///
    /// The byte counter is recomputed from the surviving records; this is the
    /// only place it is derived by a full scan.
    pub async fn restore<K, V>(self, layout: &StoreLayout) -> Index<K, V> {
        let mut index = Index::with_next_id(self.next_id.max(1));
        let mut records = std::collections::HashMap::with_capacity(self.entries.len());

        for entry in self.entries {
            let id = entry.record.id;
            if entry.key.id != id {
                warn!(id, key_id = entry.key.id, "Dropping entry with mismatched key blob");
                continue;
            }
            match build_record::<K, V>(entry) {
                Ok(record) => {
                    records.insert(id, record);
                }
                Err(e) => warn!(id, "Dropping unreadable snapshot entry: {}", e),
            }
        }

        // Insertion order first, then anything the order list forgot
        let mut seen = HashSet::with_capacity(records.len());
        let mut ordered: Vec<EntryId> = self
            .order
            .into_iter()
            .filter(|id| records.contains_key(id) && seen.insert(*id))
            .collect();
        let mut rest: Vec<EntryId> = records
            .keys()
            .filter(|id| !seen.contains(*id))
            .copied()
            .collect();
        rest.sort_unstable();
        ordered.extend(rest);

        let mut missing = 0usize;
        for id in ordered {
            let Some(record) = records.remove(&id) else {
                continue;
            };
            let key_path = record.key.path(layout);
            if !fs::try_exists(&key_path).await.unwrap_or(false) {
                missing += 1;
                continue;
            }
            index.insert(record);
        }

        if missing > 0 {
            warn!(missing, "Dropped snapshot entries whose key blob is missing");
        }
        if index.total_bytes() != self.total_bytes {
            info!(
                stored = self.total_bytes,
                recomputed = index.total_bytes(),
                "Snapshot size counter differs from its entries"
            );
        }
        index
    }

    /// Load the index of `layout`, falling back to an empty one.
    ///
    /// A missing, truncated or undecodable snapshot is never fatal.
    pub async fn load<K, V>(layout: &StoreLayout) -> Index<K, V> {
        let path = layout.snapshot_path();
        match Self::read(&path).await {
            Ok(snapshot) => {
                let index = snapshot.restore(layout).await;
                info!(
                    entries = index.len(),
                    bytes = index.total_bytes(),
                    "Loaded index snapshot"
                );
                index
            }
            Err(StashError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No index snapshot, starting empty");
                Index::new()
            }
            Err(e) => {
                warn!(path = %path.display(), "Failed to load index snapshot, starting empty: {}", e);
                Index::new()
            }
        }
    }
}

fn build_record<K, V>(entry: SnapshotEntry) -> StashResult<EntryRecord<K, V>> {
    let data = entry.record;
    let key = entry.key.into_handle(BlobKind::Key)?;
    let value = data
        .value
        .map(|descriptor| descriptor.into_handle(BlobKind::Value))
        .transpose()?;

    if key.size() != data.key_size || value.as_ref().map_or(0, |v| v.size()) != data.value_size {
        return Err(StashError::corrupt("Blob sizes disagree with record"));
    }

    Ok(EntryRecord::new(
        data.id,
        data.created_at,
        data.expires_at,
        data.stored_size,
        key,
        value,
    ))
}
