//! Stash: a persistent, self-cleaning key/value cache engine.
//!
//! This crate bundles the workspace crates behind one facade. Entries live in
//! a cache directory on disk, survive restarts through an index snapshot, and
//! are expired and evicted by a background janitor.

pub use stash_cache as cache;
pub use stash_core as core;

pub use stash_cache::{BytesCodec, CacheEngine, CacheEntry, Codec, DraftEntry, JsonCodec, SweepStats};
pub use stash_core::{CompressionLevel, StashConfig, StashError, StashResult};

/// Initialize logging for the entire system at the default level
pub fn init() -> StashResult<()> {
    stash_core::init_logging(stash_core::LogLevel::default(), stash_core::LogFormat::Text)?;
    tracing::debug!(version = VERSION, "Logging initialized");
    Ok(())
}

/// Version of the Stash system
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
