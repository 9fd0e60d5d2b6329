use std::io;
use std::path::Path;
use thiserror::Error;

/// Custom result type for Stash operations
pub type StashResult<T> = Result<T, StashError>;

/// Custom error type for Stash operations
#[derive(Debug, Error)]
pub enum StashError {
    /// A file was missing, unwritable or undeletable
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A codec failed to encode or decode an object
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An operation referenced a key with no matching entry
    #[error("Not found: {0}")]
    NotFound(String),

    /// An indexed entry whose backing data is missing or unreadable
    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StashError {
    /// Create a new IO error with a path attached to the message
    pub fn io_at(err: io::Error, path: &Path) -> Self {
        StashError::Io(io::Error::new(
            err.kind(),
            format!("{}: {}", path.display(), err),
        ))
    }

    /// Create a new serialization error
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        StashError::Serialization(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        StashError::NotFound(msg.into())
    }

    /// Create a new corruption error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        StashError::Corrupt(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        StashError::Config(msg.into())
    }

    /// Whether this error means a file did not exist.
    ///
    /// Concurrent removal makes this an expected outcome for several operations.
    pub fn is_missing_file(&self) -> bool {
        matches!(self, StashError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

impl From<serde_json::Error> for StashError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StashError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for StashError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
