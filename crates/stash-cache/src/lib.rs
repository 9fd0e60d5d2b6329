//! Persistent, self-cleaning key/value cache.
//!
//! Every entry owns a primary resource file plus a compressed key blob and an
//! optional value blob. The index lives in memory and is snapshotted to
//! `cache.index` in the cache directory, so a reopened cache sees the same
//! entries. A background janitor expires entries and keeps the cache under its
//! size budget.
//!
//! ```no_run
//! # async fn demo() -> stash_core::StashResult<()> {
//! use stash_cache::{CacheEngine, JsonCodec};
//! use stash_core::StashConfig;
//!
//! let engine: CacheEngine<String, String> =
//!     CacheEngine::open(StashConfig::new("/tmp/cache"), JsonCodec::new(), JsonCodec::new()).await?;
//!
//! let draft = engine.reserve_entry("GET /".to_string()).await.with_value("etag".to_string());
//! draft.write_resource(b"<html></html>").await?;
//! engine.add_entry(draft).await?;
//!
//! engine.start().await;
//! let hit = engine.lookup(&"GET /".to_string()).await?;
//! assert!(hit.is_some());
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod codec;
pub mod compression;
pub mod engine;
pub mod index;
mod janitor;
pub mod layout;
pub mod snapshot;

// Re-export types
pub use blob::{BlobHandle, BlobStore, Fingerprint};
pub use codec::{BytesCodec, Codec, JsonCodec};
pub use engine::{CacheEngine, CacheEntry, DraftEntry, SweepStats};
pub use index::{EntryRecord, Index};
pub use layout::{BlobKind, EntryId, StoreLayout};
pub use snapshot::Snapshot;
