//! The cache engine: index, blob files and snapshot kept consistent under one lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use stash_core::error::{StashError, StashResult};
use stash_core::{Clock, StashConfig, SystemClock};

use crate::blob::{remove_file_if_exists, BlobHandle, BlobStore, Fingerprint};
use crate::codec::Codec;
use crate::index::{EntryRecord, Index};
use crate::janitor::Janitor;
use crate::layout::{BlobKind, EntryId, StoreLayout};
use crate::snapshot::Snapshot;

/// A materialized cache entry.
///
/// This is a copy: later changes to the cache do not affect it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<K, V> {
    pub id: EntryId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Size of the primary resource file
    pub stored_size: u64,
    pub key: K,
    pub value: Option<V>,
    /// Location of the primary resource file
    pub resource_path: PathBuf,
}

/// An entry whose id has been reserved but which is not in the index yet.
///
/// The caller writes the resource to [`DraftEntry::staging_path`] and hands
/// the draft to [`CacheEngine::add_entry`].
#[derive(Debug)]
pub struct DraftEntry<K, V> {
    id: EntryId,
    key: K,
    value: Option<V>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    staging_path: PathBuf,
}

impl<K, V> DraftEntry<K, V> {
    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub fn with_value(mut self, value: V) -> Self {
        self.value = Some(value);
        self
    }

    pub fn set_value(&mut self, value: Option<V>) {
        self.value = value;
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Write the primary resource to the staging path
    pub async fn write_resource(&self, data: impl AsRef<[u8]>) -> StashResult<()> {
        if let Some(parent) = self.staging_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StashError::io_at(e, parent))?;
        }
        fs::write(&self.staging_path, data)
            .await
            .map_err(|e| StashError::io_at(e, &self.staging_path))
    }
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries removed because they expired
    pub expired: usize,
    /// Entries removed to get back under the size budget
    pub evicted: usize,
    /// Removals whose file deletion failed
    pub failures: usize,
    /// Whether a snapshot was written
    pub persisted: bool,
}

impl SweepStats {
    pub fn removed(&self) -> usize {
        self.expired + self.evicted
    }
}

/// Everything guarded by the state lock
struct CacheState<K, V> {
    config: StashConfig,
    store: BlobStore,
    index: Index<K, V>,
}

impl<K, V> CacheState<K, V>
where
    K: PartialEq,
{
    /// Create the directory tree of `config` and load its snapshot
    async fn open(config: StashConfig) -> StashResult<Self> {
        let layout = StoreLayout::new(&config.directory);
        layout.create().await?;

        let stale = layout.clear_staging().await?;
        if stale > 0 {
            info!(stale, "Removed uncommitted staging files");
        }

        let index = Snapshot::load(&layout).await;
        info!(
            directory = %layout.root().display(),
            entries = index.len(),
            bytes = index.total_bytes(),
            "Opened cache directory"
        );

        Ok(Self {
            store: BlobStore::new(layout, config.compression_level),
            config,
            index,
        })
    }

    fn layout(&self) -> &StoreLayout {
        self.store.layout()
    }

    /// Find the record whose key equals `probe`.
    ///
    /// A single candidate in the fingerprint bucket is accepted as is; when
    /// several share the fingerprint their keys are materialized and compared.
    async fn find(&self, probe: &K, fingerprint: Fingerprint, codec: &dyn Codec<K>) -> Option<EntryId> {
        match self.index.candidates(&fingerprint) {
            [] => None,
            [only] => Some(*only),
            many => {
                for id in many {
                    let Some(record) = self.index.get(*id) else {
                        continue;
                    };
                    match record.key.matches(probe, fingerprint, &self.store, codec).await {
                        Ok(true) => return Some(*id),
                        Ok(false) => {}
                        Err(e) => debug!(id, "Skipping unreadable key candidate: {}", e),
                    }
                }
                None
            }
        }
    }

    /// Unlink a record and delete its files.
    ///
    /// Files go value blob first, then key blob, then resource. Every file is
    /// attempted even when an earlier one fails; the record stays unlinked and
    /// the first error is returned.
    async fn remove_record(&mut self, id: EntryId) -> StashResult<Option<EntryRecord<K, V>>> {
        let Some(record) = self.index.remove(id) else {
            return Ok(None);
        };

        let mut first_error = None;
        if let Some(value) = &record.value {
            if let Err(e) = self.store.remove(value).await {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.store.remove(&record.key).await {
            first_error.get_or_insert(e);
        }
        if let Err(e) = remove_file_if_exists(&self.layout().resource_path(id)).await {
            first_error.get_or_insert(e);
        }
        self.layout().prune_shard(id).await;

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(id, bytes = record.footprint(), "Removed cache entry");
                Ok(Some(record))
            }
        }
    }

    /// Delete whatever files a failed commit left behind
    async fn discard(&self, id: EntryId) {
        let layout = self.layout();
        for path in [
            layout.blob_path(id, BlobKind::Value),
            layout.blob_path(id, BlobKind::Key),
            layout.resource_path(id),
        ] {
            if let Err(e) = remove_file_if_exists(&path).await {
                warn!(path = %path.display(), "Failed to discard file: {}", e);
            }
        }
        layout.prune_shard(id).await;
    }
}

/// State shared between the engine handle and its janitor
pub(crate) struct EngineCore<K, V> {
    state: RwLock<CacheState<K, V>>,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    clock: Arc<dyn Clock>,
    dirty: AtomicBool,
    /// Serializes snapshot writes; taken before the state lock
    persist_lock: Mutex<()>,
}

impl<K, V> EngineCore<K, V>
where
    K: PartialEq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) async fn cleanup_interval(&self) -> Duration {
        self.state.read().await.config.cleanup_interval()
    }

    /// Write a snapshot of the current index
    pub(crate) async fn persist(&self) -> StashResult<()> {
        let _guard = self.persist_lock.lock().await;
        self.dirty.store(false, Ordering::Release);

        let (snapshot, layout, level) = {
            let state = self.state.read().await;
            (
                Snapshot::capture(&state.index),
                state.layout().clone(),
                state.store.level(),
            )
        };

        if let Err(e) = snapshot.write(&layout, level).await {
            self.mark_dirty();
            error!(
                directory = %layout.root().display(),
                "Failed to write index snapshot: {}", e
            );
            return Err(e);
        }
        Ok(())
    }

    /// Read both blobs of `record`, failing if the value blob is gone
    async fn materialize(
        &self,
        store: &BlobStore,
        record: &EntryRecord<K, V>,
    ) -> StashResult<CacheEntry<K, V>> {
        let value = match &record.value {
            Some(handle) => {
                if !store.exists(handle).await {
                    return Err(StashError::corrupt(format!(
                        "value blob of entry {} is missing",
                        record.id
                    )));
                }
                Some(handle.materialize(store, &*self.value_codec).await?)
            }
            None => None,
        };
        let key = record.key.materialize(store, &*self.key_codec).await?;

        Ok(CacheEntry {
            id: record.id,
            created_at: record.created_at,
            expires_at: record.expires_at,
            stored_size: record.stored_size,
            key,
            value,
            resource_path: store.layout().resource_path(record.id),
        })
    }

    /// Remove a record found to be corrupt, unless it changed in the meantime
    async fn evict_corrupt(&self, layout: &StoreLayout, record: &EntryRecord<K, V>) {
        let mut state = self.state.write().await;
        let unchanged = state.layout() == layout
            && state.index.get(record.id).is_some_and(|current| {
                current.key.fingerprint() == record.key.fingerprint()
                    && current.value.as_ref().map(BlobHandle::fingerprint)
                        == record.value.as_ref().map(BlobHandle::fingerprint)
            });
        if !unchanged {
            return;
        }

        if let Err(e) = state.remove_record(record.id).await {
            warn!(id = record.id, "Failed to delete files of corrupt entry: {}", e);
        }
        self.mark_dirty();
    }

    /// One janitor pass: expiry, then size eviction, then snapshot
    pub(crate) async fn run_cleanup(&self) -> SweepStats {
        let now = self.clock.now();
        let mut stats = SweepStats::default();

        // Copy what we need so the write lock is only taken per removal
        let (expired, over_budget) = {
            let state = self.state.read().await;
            let expired: Vec<EntryId> = state
                .index
                .iter()
                .filter(|record| record.is_expired(now))
                .map(|record| record.id)
                .collect();
            (
                expired,
                state.index.total_bytes() > state.config.max_size_bytes,
            )
        };

        for id in expired {
            let mut state = self.state.write().await;
            if !state.index.get(id).is_some_and(|r| r.is_expired(now)) {
                continue;
            }
            stats.expired += 1;
            if let Err(e) = state.remove_record(id).await {
                stats.failures += 1;
                warn!(id, "Failed to remove expired cache entry: {}", e);
            }
        }

        {
            let mut state = self.state.write().await;
            while state.index.total_bytes() > state.config.max_size_bytes {
                let Some(id) = state.index.oldest() else {
                    break;
                };
                stats.evicted += 1;
                if let Err(e) = state.remove_record(id).await {
                    stats.failures += 1;
                    warn!(id, "Failed to evict cache entry: {}", e);
                }
            }
        }

        if stats.removed() > 0 {
            self.mark_dirty();
        }
        if stats.removed() > 0 || over_budget || self.is_dirty() {
            stats.persisted = self.persist().await.is_ok();
        }
        stats
    }
}

/// Persistent key/value cache.
///
/// Keys are compared by content through the key codec; values are opaque.
/// Every entry also owns a primary resource file, written by the caller
/// through a [`DraftEntry`].
pub struct CacheEngine<K, V> {
    core: Arc<EngineCore<K, V>>,
    janitor: Mutex<Option<Janitor>>,
}

impl<K, V> CacheEngine<K, V>
where
    K: PartialEq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Open the cache directory of `config` using the system clock
    pub async fn open<KC, VC>(config: StashConfig, key_codec: KC, value_codec: VC) -> StashResult<Self>
    where
        KC: Codec<K> + 'static,
        VC: Codec<V> + 'static,
    {
        Self::open_with_clock(config, key_codec, value_codec, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock<KC, VC>(
        config: StashConfig,
        key_codec: KC,
        value_codec: VC,
        clock: Arc<dyn Clock>,
    ) -> StashResult<Self>
    where
        KC: Codec<K> + 'static,
        VC: Codec<V> + 'static,
    {
        config.validate()?;
        let state = CacheState::open(config).await?;

        Ok(Self {
            core: Arc::new(EngineCore {
                state: RwLock::new(state),
                key_codec: Arc::new(key_codec),
                value_codec: Arc::new(value_codec),
                clock,
                dirty: AtomicBool::new(false),
                persist_lock: Mutex::new(()),
            }),
            janitor: Mutex::new(None),
        })
    }

    /// Apply new settings.
    ///
    /// Moving to another directory writes the snapshot of the current one
    /// first and then opens (and if needed creates) the new one.
    pub async fn configure(&self, config: StashConfig) -> StashResult<()> {
        config.validate()?;

        let _persist = self.core.persist_lock.lock().await;
        let mut state = self.core.state.write().await;

        if state.config.directory == config.directory {
            state.store.set_level(config.compression_level);
            state.config = config;
            return Ok(());
        }

        let snapshot = Snapshot::capture(&state.index);
        if let Err(e) = snapshot.write(state.layout(), state.store.level()).await {
            error!(
                directory = %state.layout().root().display(),
                "Failed to write index snapshot before switching directory: {}", e
            );
        }

        *state = CacheState::open(config).await?;
        self.core.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Reserve an id for a new entry
    pub async fn reserve_entry(&self, key: K) -> DraftEntry<K, V> {
        let mut state = self.core.state.write().await;
        let id = state.index.allocate_id();
        self.core.mark_dirty();

        let created_at = self.core.clock.now();
        let ttl = chrono::Duration::from_std(state.config.default_ttl())
            .unwrap_or(chrono::Duration::MAX);
        let expires_at = created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        DraftEntry {
            id,
            key,
            value: None,
            created_at,
            expires_at,
            staging_path: state.layout().staging_path(id),
        }
    }

    /// Commit a draft whose resource has been written to its staging path.
    ///
    /// An existing entry with an equal key is removed first. A staging file
    /// that is gone (for instance removed concurrently) yields an `Io` error
    /// with kind `NotFound` and leaves the index untouched.
    pub async fn add_entry(&self, draft: DraftEntry<K, V>) -> StashResult<()> {
        let DraftEntry {
            id,
            key,
            value,
            created_at,
            expires_at,
            staging_path,
        } = draft;
        let key_codec = &*self.core.key_codec;
        let value_codec = &*self.core.value_codec;

        let mut guard = self.core.state.write().await;
        let state = &mut *guard;
        let resource = state.layout().resource_path(id);

        // The shard directory is created under the write lock, the same lock
        // under which removals prune empty shards.
        let shard = state.layout().shard_dir(id);
        fs::create_dir_all(&shard)
            .await
            .map_err(|e| StashError::io_at(e, &shard))?;
        if let Err(e) = fs::rename(&staging_path, &resource).await {
            if e.kind() == std::io::ErrorKind::NotFound {
                debug!(id, "Staged resource is gone, nothing to add");
            }
            state.layout().prune_shard(id).await;
            return Err(StashError::io_at(e, &staging_path));
        }

        let written = async {
            let stored_size = fs::metadata(&resource)
                .await
                .map_err(|e| StashError::io_at(e, &resource))?
                .len();
            let value = match &value {
                Some(value) => Some(state.store.store(value, value_codec, id, BlobKind::Value).await?),
                None => None,
            };
            let key = state.store.store(&key, key_codec, id, BlobKind::Key).await?;
            Ok::<_, StashError>((stored_size, key, value))
        }
        .await;

        let (stored_size, key_handle, value_handle) = match written {
            Ok(handles) => handles,
            Err(e) => {
                state.discard(id).await;
                return Err(e);
            }
        };

        let prior = state.find(&key, key_handle.fingerprint(), key_codec).await;
        if let Some(prior) = prior {
            if let Err(e) = state.remove_record(prior).await {
                warn!(id = prior, "Failed to delete files of replaced entry: {}", e);
            }
        }

        let record = EntryRecord::new(
            id,
            created_at,
            expires_at,
            stored_size,
            key_handle,
            value_handle,
        );
        debug!(id, bytes = record.footprint(), "Added cache entry");
        state.index.insert(record);
        self.core.mark_dirty();
        Ok(())
    }

    /// Look up the entry for `key`.
    ///
    /// An entry whose blobs cannot be read is evicted and reported as a miss.
    pub async fn lookup(&self, key: &K) -> StashResult<Option<CacheEntry<K, V>>> {
        let fingerprint = BlobStore::fingerprint(key, &*self.core.key_codec)?;

        // Blobs are read under the read guard: `update` rewrites them in place
        // and must not run between finding the record and reading it.
        let (record, layout, error) = {
            let state = self.core.state.read().await;
            let Some(id) = state.find(key, fingerprint, &*self.core.key_codec).await else {
                return Ok(None);
            };
            let Some(record) = state.index.get(id) else {
                return Ok(None);
            };
            match self.core.materialize(&state.store, record).await {
                Ok(entry) if entry.key == *key => return Ok(Some(entry)),
                Ok(_) => {
                    debug!(id, "Fingerprint matched a different key");
                    return Ok(None);
                }
                Err(e) => (record.clone(), state.layout().clone(), e),
            }
        };

        warn!(id = record.id, "Evicting corrupt cache entry: {}", error);
        self.core.evict_corrupt(&layout, &record).await;
        Ok(None)
    }

    /// Replace key, value and metadata of the entry found by `old_key`.
    ///
    /// The entry keeps its id and its place in eviction order.
    pub async fn update(
        &self,
        old_key: &K,
        new_key: K,
        new_value: Option<V>,
        expires_at: DateTime<Utc>,
        stored_size: u64,
    ) -> StashResult<()> {
        let key_codec = &*self.core.key_codec;
        let value_codec = &*self.core.value_codec;
        let fingerprint = BlobStore::fingerprint(old_key, key_codec)?;

        let mut guard = self.core.state.write().await;
        let state = &mut *guard;

        let Some(id) = state.find(old_key, fingerprint, key_codec).await else {
            warn!("No cache entry to update");
            return Err(StashError::not_found("no cache entry matches the old key"));
        };
        let old_value = state.index.get(id).and_then(|r| r.value.clone());

        let written = async {
            let value = match &new_value {
                Some(value) => Some(state.store.store(value, value_codec, id, BlobKind::Value).await?),
                None => {
                    if let Some(old) = &old_value {
                        state.store.remove(old).await?;
                    }
                    None
                }
            };
            let key = state.store.store(&new_key, key_codec, id, BlobKind::Key).await?;
            Ok::<_, StashError>((key, value))
        }
        .await;

        let (key_handle, value_handle) = match written {
            Ok(handles) => handles,
            Err(e) => {
                // Blobs on disk no longer match the record
                warn!(id, "Update failed, dropping entry: {}", e);
                if let Err(e) = state.remove_record(id).await {
                    warn!(id, "Failed to delete files of entry: {}", e);
                }
                self.core.mark_dirty();
                return Err(e);
            }
        };

        // Keep keys unique: another entry may already hold the new key
        let mut duplicates = Vec::new();
        for other in state.index.candidates(&key_handle.fingerprint()) {
            if *other == id {
                continue;
            }
            let Some(record) = state.index.get(*other) else {
                continue;
            };
            match key_handle.content_eq(&record.key, &state.store, key_codec).await {
                Ok(true) => duplicates.push(*other),
                Ok(false) => {}
                Err(e) => debug!(id = *other, "Skipping unreadable key candidate: {}", e),
            }
        }
        for other in duplicates {
            if let Err(e) = state.remove_record(other).await {
                warn!(id = other, "Failed to delete files of replaced entry: {}", e);
            }
        }

        state.index.update(id, |record| {
            record.key = key_handle;
            record.value = value_handle;
            record.expires_at = expires_at;
            record.stored_size = stored_size;
        });
        debug!(id, "Updated cache entry");
        self.core.mark_dirty();
        Ok(())
    }

    /// Remove the entry for `key`. Returns whether there was one.
    pub async fn remove(&self, key: &K) -> StashResult<bool> {
        let fingerprint = BlobStore::fingerprint(key, &*self.core.key_codec)?;

        let mut state = self.core.state.write().await;
        let Some(id) = state.find(key, fingerprint, &*self.core.key_codec).await else {
            return Ok(false);
        };

        let result = state.remove_record(id).await;
        self.core.mark_dirty();
        result.map(|removed| removed.is_some())
    }

    /// Remove every entry
    pub async fn clear(&self) -> StashResult<()> {
        let mut state = self.core.state.write().await;
        let ids: Vec<EntryId> = state.index.iter().map(|record| record.id).collect();

        let mut first_error = None;
        for id in ids {
            if let Err(e) = state.remove_record(id).await {
                warn!(id, "Failed to delete files of cache entry: {}", e);
                first_error.get_or_insert(e);
            }
        }
        state.index.reset_total_bytes();
        self.core.mark_dirty();
        info!("Cleared cache");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Materialize every entry, in insertion order.
    ///
    /// Everything is read under one read guard, so the result is a
    /// point-in-time copy: writers wait until it is complete. Entries that
    /// cannot be read are skipped.
    pub async fn iterate_entries(&self) -> Vec<CacheEntry<K, V>> {
        let state = self.core.state.read().await;

        let mut entries = Vec::with_capacity(state.index.len());
        for record in state.index.iter() {
            match self.core.materialize(&state.store, record).await {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(id = record.id, "Skipping unreadable cache entry: {}", e),
            }
        }
        entries
    }

    /// Write the index snapshot now
    pub async fn flush(&self) -> StashResult<()> {
        self.core.persist().await
    }

    /// Start the janitor. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut janitor = self.janitor.lock().await;
        if janitor.is_none() {
            *janitor = Some(Janitor::spawn(self.core.clone()));
        }
    }

    /// Stop the janitor and wait for it to exit
    pub async fn stop(&self) {
        let janitor = self.janitor.lock().await.take();
        if let Some(janitor) = janitor {
            janitor.stop().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.janitor.lock().await.is_some()
    }

    /// Run one expiry and eviction pass on the calling task
    pub async fn run_cleanup(&self) -> SweepStats {
        self.core.run_cleanup().await
    }

    /// Bytes occupied by resources and blobs of all entries
    pub async fn current_size_bytes(&self) -> u64 {
        self.core.state.read().await.index.total_bytes()
    }

    pub async fn entry_count(&self) -> usize {
        self.core.state.read().await.index.len()
    }

    pub async fn directory(&self) -> PathBuf {
        self.core.state.read().await.config.directory.clone()
    }

    pub async fn config(&self) -> StashConfig {
        self.core.state.read().await.config.clone()
    }
}

impl<K, V> Drop for CacheEngine<K, V> {
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.get_mut().take() {
            janitor.signal();
        }
    }
}
