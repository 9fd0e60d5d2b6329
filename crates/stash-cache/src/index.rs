//! In-memory index of cache entries.
//!
//! The index never touches the disk. Deciding whether two keys with the same
//! fingerprint are really equal is left to the caller, which can materialize
//! blobs. Every mutator takes `&mut self`; inside the engine that is only
//! reachable through the write guard of the state lock.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::blob::{BlobHandle, Fingerprint};
use crate::layout::EntryId;

/// Metadata for one cache entry
pub struct EntryRecord<K, V> {
    pub id: EntryId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Size of the primary resource file
    pub stored_size: u64,
    pub key: BlobHandle<K>,
    pub value: Option<BlobHandle<V>>,
    /// Position in insertion order, assigned by the index
    seq: u64,
}

impl<K, V> EntryRecord<K, V> {
    pub fn new(
        id: EntryId,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        stored_size: u64,
        key: BlobHandle<K>,
        value: Option<BlobHandle<V>>,
    ) -> Self {
        Self {
            id,
            created_at,
            expires_at,
            stored_size,
            key,
            value,
            seq: 0,
        }
    }

    pub fn key_size(&self) -> u64 {
        self.key.size()
    }

    pub fn value_size(&self) -> u64 {
        self.value.as_ref().map_or(0, |v| v.size())
    }

    /// Bytes this entry occupies on disk
    pub fn footprint(&self) -> u64 {
        self.stored_size + self.key_size() + self.value_size()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

impl<K, V> Clone for EntryRecord<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            created_at: self.created_at,
            expires_at: self.expires_at,
            stored_size: self.stored_size,
            key: self.key.clone(),
            value: self.value.clone(),
            seq: self.seq,
        }
    }
}

impl<K, V> std::fmt::Debug for EntryRecord<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryRecord")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("stored_size", &self.stored_size)
            .field("key", &self.key)
            .field("value", &self.value)
            .finish()
    }
}

/// Records bucketed by key fingerprint, plus their insertion order
pub struct Index<K, V> {
    records: HashMap<EntryId, EntryRecord<K, V>>,
    buckets: HashMap<Fingerprint, Vec<EntryId>>,
    /// Insertion order. Eviction walks this from the front, so the policy is
    /// FIFO: lookups do not refresh an entry's position.
    order: BTreeMap<u64, EntryId>,
    total_bytes: u64,
    next_id: EntryId,
    next_seq: u64,
}

impl<K, V> Index<K, V> {
    pub fn new() -> Self {
        Self::with_next_id(1)
    }

    pub fn with_next_id(next_id: EntryId) -> Self {
        Self {
            records: HashMap::new(),
            buckets: HashMap::new(),
            order: BTreeMap::new(),
            total_bytes: 0,
            next_id,
            next_seq: 0,
        }
    }

    /// Hand out a fresh entry id. Ids are never reused.
    pub fn allocate_id(&mut self) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn next_id(&self) -> EntryId {
        self.next_id
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: EntryId) -> Option<&EntryRecord<K, V>> {
        self.records.get(&id)
    }

    /// Ids of the records whose key has `fingerprint`, oldest first
    pub fn candidates(&self, fingerprint: &Fingerprint) -> &[EntryId] {
        self.buckets
            .get(fingerprint)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Id of the oldest inserted record
    pub fn oldest(&self) -> Option<EntryId> {
        self.order.values().next().copied()
    }

    /// Records in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &EntryRecord<K, V>> + '_ {
        self.order.values().filter_map(|id| self.records.get(id))
    }

    /// Insert a record at the end of the insertion order.
    ///
    /// The caller must have removed any record with an equal key first. A
    /// record with the same id is replaced.
    pub fn insert(&mut self, mut record: EntryRecord<K, V>) {
        self.remove(record.id);

        record.seq = self.next_seq;
        self.next_seq += 1;
        if record.id >= self.next_id {
            self.next_id = record.id + 1;
        }

        self.total_bytes += record.footprint();
        self.buckets
            .entry(record.key.fingerprint())
            .or_default()
            .push(record.id);
        self.order.insert(record.seq, record.id);
        self.records.insert(record.id, record);
    }

    /// Unlink a record from every structure
    pub fn remove(&mut self, id: EntryId) -> Option<EntryRecord<K, V>> {
        let record = self.records.remove(&id)?;

        self.order.remove(&record.seq);
        let fingerprint = record.key.fingerprint();
        if let Some(bucket) = self.buckets.get_mut(&fingerprint) {
            bucket.retain(|candidate| *candidate != id);
            if bucket.is_empty() {
                self.buckets.remove(&fingerprint);
            }
        }
        self.total_bytes -= record.footprint();

        Some(record)
    }

    /// Change a record in place, keeping its id and insertion position
    pub fn update<F>(&mut self, id: EntryId, f: F) -> bool
    where
        F: FnOnce(&mut EntryRecord<K, V>),
    {
        let Some(mut record) = self.remove(id) else {
            return false;
        };
        let seq = record.seq;

        f(&mut record);
        record.id = id;
        record.seq = seq;

        self.total_bytes += record.footprint();
        self.buckets
            .entry(record.key.fingerprint())
            .or_default()
            .push(id);
        self.order.insert(seq, id);
        self.records.insert(id, record);
        true
    }

    /// Force the byte counter back to zero on an empty index
    pub fn reset_total_bytes(&mut self) {
        debug_assert!(self.records.is_empty());
        self.total_bytes = 0;
    }
}

impl<K, V> Default for Index<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
