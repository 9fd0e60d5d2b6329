//! On-disk layout of a cache directory.
//!
//! ```text
//! <root>/cache.index          index snapshot
//! <root>/staging/<id>         resources awaiting commit
//! <root>/<aa>/<bb>/<id>       primary resource
//! <root>/<aa>/<bb>/<id>.key   key blob
//! <root>/<aa>/<bb>/<id>.hook  value blob
//! ```
//!
//! `aa` and `bb` are the second and third lowest bytes of the entry id in hex.
//! Ids below 2^24 put at most 256 entries in a shard; higher bytes are not part
//! of the path, so larger ids share shards with smaller ones.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use stash_core::error::{StashError, StashResult};

/// Identity of a cache entry
pub type EntryId = u64;

const SNAPSHOT_FILE: &str = "cache.index";
const STAGING_DIR: &str = "staging";

/// Which object of an entry a blob holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobKind {
    Key,
    Value,
}

impl BlobKind {
    pub fn extension(self) -> &'static str {
        match self {
            BlobKind::Key => "key",
            BlobKind::Value => "hook",
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Path arithmetic for one cache root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    pub fn snapshot_tmp_path(&self) -> PathBuf {
        self.root.join(format!("{}.tmp", SNAPSHOT_FILE))
    }

    /// Where a draft's resource is written before it is committed
    pub fn staging_path(&self, id: EntryId) -> PathBuf {
        self.staging_dir().join(id.to_string())
    }

    pub fn shard_dir(&self, id: EntryId) -> PathBuf {
        self.root
            .join(format!("{:02x}", (id >> 16) & 0xff))
            .join(format!("{:02x}", (id >> 8) & 0xff))
    }

    pub fn resource_path(&self, id: EntryId) -> PathBuf {
        self.shard_dir(id).join(id.to_string())
    }

    pub fn blob_path(&self, id: EntryId, kind: BlobKind) -> PathBuf {
        self.shard_dir(id)
            .join(format!("{}.{}", id, kind.extension()))
    }

    /// Create the root and staging directories
    pub async fn create(&self) -> StashResult<()> {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| StashError::io_at(e, &staging))
    }

    /// Remove leftovers of drafts that were never committed
    pub async fn clear_staging(&self) -> StashResult<usize> {
        let staging = self.staging_dir();
        let mut entries = match fs::read_dir(&staging).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StashError::io_at(e, &staging)),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to remove staged file: {}", e),
            }
        }
        Ok(removed)
    }

    /// Remove the shard directories of `id` if they are empty.
    ///
    /// Must only be called while holding the index write lock, since commits
    /// recreate shard directories under the same lock.
    pub async fn prune_shard(&self, id: EntryId) {
        let leaf = self.shard_dir(id);
        if remove_if_empty(&leaf).await {
            if let Some(parent) = leaf.parent() {
                remove_if_empty(parent).await;
            }
        }
    }
}

async fn remove_if_empty(dir: &Path) -> bool {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return false,
    };

    match entries.next_entry().await {
        Ok(None) => match fs::remove_dir(dir).await {
            Ok(()) => {
                debug!(dir = %dir.display(), "Removed empty shard directory");
                true
            }
            Err(e) => {
                warn!("Failed to remove empty directory: {}", e);
                false
            }
        },
        _ => false,
    }
}
