#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stash::core::ManualClock;
use stash::{CacheEngine, JsonCodec, StashConfig};

/// Request identity used as cache key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn get(url: &str) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.to_string(),
        }
    }
}

/// Response metadata stored as cache value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status: u16,
    pub etag: String,
}

impl ResponseMeta {
    pub fn ok(etag: &str) -> Self {
        Self {
            status: 200,
            etag: etag.to_string(),
        }
    }
}

pub type Engine = CacheEngine<RequestKey, ResponseMeta>;

pub fn config(dir: &Path) -> StashConfig {
    let mut config = StashConfig::new(dir);
    config.default_ttl_millis = 60_000;
    config.max_size_bytes = 1024 * 1024;
    config
}

pub async fn open(config: StashConfig, clock: Arc<ManualClock>) -> Engine {
    CacheEngine::open_with_clock(config, JsonCodec::new(), JsonCodec::new(), clock)
        .await
        .unwrap()
}

/// Reserve, write and commit one entry; returns its id
pub async fn put(engine: &Engine, url: &str, etag: &str, body: &[u8]) -> u64 {
    let draft = engine
        .reserve_entry(RequestKey::get(url))
        .await
        .with_value(ResponseMeta::ok(etag));
    draft.write_resource(body).await.unwrap();
    let id = draft.id();
    engine.add_entry(draft).await.unwrap();
    id
}

/// Entry files (resources and blobs) outside the staging directory
pub fn entry_files(root: &Path) -> Vec<std::path::PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| !path.starts_with(root.join("staging")))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map_or(true, |name| !name.starts_with("cache.index"))
        })
        .collect()
}
