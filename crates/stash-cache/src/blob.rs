//! Storage of single keys and values as compressed files.

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::trace;

use stash_core::error::{StashError, StashResult};
use stash_core::CompressionLevel;

use crate::codec::Codec;
use crate::compression;
use crate::layout::{BlobKind, EntryId, StoreLayout};

/// blake3 digest of an encoded object
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.to_hex()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = StashError;

    fn try_from(hex: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&hex)
            .map_err(|e| StashError::serialization(format!("Invalid fingerprint: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            StashError::serialization("Invalid fingerprint: expected 32 bytes")
        })?;
        Ok(Self(blake3::Hash::from_bytes(bytes)))
    }
}

/// Reference to one stored key or value.
///
/// The handle knows where its file lives and the fingerprint of the encoded
/// object, so it can be bucketed without touching the disk. Content is only
/// read through [`BlobHandle::materialize`] and [`BlobHandle::content_eq`].
pub struct BlobHandle<T> {
    id: EntryId,
    kind: BlobKind,
    fingerprint: Fingerprint,
    size: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BlobHandle<T> {
    pub(crate) fn new(id: EntryId, kind: BlobKind, fingerprint: Fingerprint, size: u64) -> Self {
        Self {
            id,
            kind,
            fingerprint,
            size,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Size of the compressed file in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self, layout: &StoreLayout) -> PathBuf {
        layout.blob_path(self.id, self.kind)
    }

    /// Read and decode the object behind this handle
    pub async fn materialize(&self, store: &BlobStore, codec: &dyn Codec<T>) -> StashResult<T> {
        store.resolve(self, codec).await
    }

    /// Compare the stored contents of two handles.
    ///
    /// Differing fingerprints settle the question without I/O, otherwise both
    /// sides are materialized.
    pub async fn content_eq(
        &self,
        other: &Self,
        store: &BlobStore,
        codec: &dyn Codec<T>,
    ) -> StashResult<bool>
    where
        T: PartialEq,
    {
        if self.fingerprint != other.fingerprint {
            return Ok(false);
        }
        if self.id == other.id && self.kind == other.kind {
            return Ok(true);
        }
        let (left, right) = (
            self.materialize(store, codec).await?,
            other.materialize(store, codec).await?,
        );
        Ok(left == right)
    }

    /// Compare the stored contents with an in-memory probe
    pub async fn matches(
        &self,
        probe: &T,
        probe_fingerprint: Fingerprint,
        store: &BlobStore,
        codec: &dyn Codec<T>,
    ) -> StashResult<bool>
    where
        T: PartialEq,
    {
        if self.fingerprint != probe_fingerprint {
            return Ok(false);
        }
        Ok(self.materialize(store, codec).await? == *probe)
    }
}

impl<T> Clone for BlobHandle<T> {
    fn clone(&self) -> Self {
        Self::new(self.id, self.kind, self.fingerprint, self.size)
    }
}

impl<T> fmt::Debug for BlobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("fingerprint", &self.fingerprint)
            .field("size", &self.size)
            .finish()
    }
}

/// Reads and writes compressed blob files under one cache root
#[derive(Debug, Clone)]
pub struct BlobStore {
    layout: StoreLayout,
    level: CompressionLevel,
}

impl BlobStore {
    pub fn new(layout: StoreLayout, level: CompressionLevel) -> Self {
        Self { layout, level }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    pub fn set_level(&mut self, level: CompressionLevel) {
        self.level = level;
    }

    /// Fingerprint of an object as it would be stored
    pub fn fingerprint<T>(object: &T, codec: &dyn Codec<T>) -> StashResult<Fingerprint> {
        Ok(Fingerprint::of(&codec.encode(object)?))
    }

    /// Encode, compress and write `object` as the `kind` blob of entry `id`.
    ///
    /// The file is written next to its final location and renamed into place,
    /// so an existing blob is replaced atomically.
    pub async fn store<T>(
        &self,
        object: &T,
        codec: &dyn Codec<T>,
        id: EntryId,
        kind: BlobKind,
    ) -> StashResult<BlobHandle<T>> {
        let encoded = codec.encode(object)?;
        let fingerprint = Fingerprint::of(&encoded);
        let compressed = compression::compress(&encoded, self.level)?;

        let path = self.layout.blob_path(id, kind);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StashError::io_at(e, parent))?;
        }

        let tmp = path.with_extension(format!("{}.tmp", kind.extension()));
        fs::write(&tmp, &compressed)
            .await
            .map_err(|e| StashError::io_at(e, &tmp))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StashError::io_at(e, &path));
        }

        trace!(id, %kind, size = compressed.len(), "Stored blob");
        Ok(BlobHandle::new(
            id,
            kind,
            fingerprint,
            compressed.len() as u64,
        ))
    }

    /// Read, decompress and decode the object behind `handle`
    pub async fn resolve<T>(&self, handle: &BlobHandle<T>, codec: &dyn Codec<T>) -> StashResult<T> {
        let path = handle.path(&self.layout);
        let compressed = fs::read(&path)
            .await
            .map_err(|e| StashError::io_at(e, &path))?;
        let encoded = compression::decompress(&compressed)?;
        codec.decode(&encoded)
    }

    pub async fn exists<T>(&self, handle: &BlobHandle<T>) -> bool {
        fs::try_exists(handle.path(&self.layout))
            .await
            .unwrap_or(false)
    }

    /// Delete the file behind `handle`; a missing file is not an error
    pub async fn remove<T>(&self, handle: &BlobHandle<T>) -> StashResult<()> {
        remove_file_if_exists(&handle.path(&self.layout)).await
    }
}

pub(crate) async fn remove_file_if_exists(path: &std::path::Path) -> StashResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StashError::io_at(e, path)),
    }
}
