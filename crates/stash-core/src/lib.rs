//! Core types for the Stash cache engine.
//!
//! This crate provides the error type, configuration, logging bootstrap and
//! time sources shared by the rest of the Stash workspace.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{CompressionLevel, StashConfig};
pub use crate::error::{StashError, StashResult};
pub use crate::logging::{init_logging, LogFormat, LogLevel};
