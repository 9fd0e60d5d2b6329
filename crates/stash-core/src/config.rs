use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{StashError, StashResult};

/// Default size budget: 10 MiB
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 10 * 1024 * 1024;
/// Default time to live: 24 hours
pub const DEFAULT_TTL_MILLIS: u64 = 24 * 60 * 60 * 1000;
/// Default pause between janitor sweeps
pub const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 60;

/// Compression level for blob and snapshot files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// No compression
    None,
    /// Fast compression with moderate ratio
    Fast,
    /// Default compression level
    #[default]
    Default,
    /// Maximum compression
    Best,
}

impl From<CompressionLevel> for i32 {
    fn from(level: CompressionLevel) -> Self {
        match level {
            CompressionLevel::None => 0,
            CompressionLevel::Fast => 1,
            CompressionLevel::Default => 3,
            CompressionLevel::Best => 19,
        }
    }
}

impl std::str::FromStr for CompressionLevel {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "fast" => Ok(Self::Fast),
            "default" => Ok(Self::Default),
            "best" => Ok(Self::Best),
            other => Err(StashError::config(format!(
                "Unknown compression level: {}",
                other
            ))),
        }
    }
}

/// Configuration for a cache engine.
///
/// Every key is optional; missing keys take the defaults above. Keys use the
/// same camelCase spelling in TOML files and in string key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StashConfig {
    /// Cache root directory
    pub directory: PathBuf,
    /// Size budget enforced by the janitor
    pub max_size_bytes: u64,
    /// Lifetime given to newly reserved entries
    pub default_ttl_millis: u64,
    /// Pause between janitor sweeps
    pub cleanup_interval_seconds: u64,
    /// Compression used for blobs and the index snapshot
    pub compression_level: CompressionLevel,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            default_ttl_millis: DEFAULT_TTL_MILLIS,
            cleanup_interval_seconds: DEFAULT_CLEANUP_INTERVAL_SECONDS,
            compression_level: CompressionLevel::default(),
        }
    }
}

/// Get the default cache directory
fn default_directory() -> PathBuf {
    std::env::temp_dir().join("stash-cache")
}

impl StashConfig {
    /// Create a configuration rooted at `directory` with default limits
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> StashResult<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| StashError::io_at(e, path))?;
        Self::from_toml(&contents)
    }

    /// Create config from TOML string
    pub fn from_toml(content: &str) -> StashResult<Self> {
        toml::from_str(content)
            .map_err(|e| StashError::config(format!("Failed to parse config: {}", e)))
    }

    /// Convert config to TOML string
    pub fn to_toml(&self) -> StashResult<String> {
        toml::to_string(self)
            .map_err(|e| StashError::config(format!("Failed to serialize config: {}", e)))
    }

    /// Build a configuration from string-keyed options.
    ///
    /// Unknown keys are skipped with a warning, malformed values are an error.
    pub fn from_pairs<I, K, V>(pairs: I) -> StashResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            match key {
                "directory" => config.directory = PathBuf::from(value),
                "maxSizeBytes" => config.max_size_bytes = parse_number(key, value)?,
                "defaultTtlMillis" => config.default_ttl_millis = parse_number(key, value)?,
                "cleanupIntervalSeconds" => {
                    config.cleanup_interval_seconds = parse_number(key, value)?
                }
                "compressionLevel" => config.compression_level = value.parse()?,
                other => warn!(key = other, "Ignoring unknown cache option"),
            }
        }
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> StashResult<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(StashError::config("Cache directory must not be empty"));
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(StashError::config(
                "Cleanup interval must be at least one second",
            ));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_millis)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

fn parse_number(key: &str, value: &str) -> StashResult<u64> {
    value
        .parse()
        .map_err(|e| StashError::config(format!("Invalid value for {}: {:?} ({})", key, value, e)))
}
