//! Shared library for the anime downloader.
//!
//! This crate provides the pieces every binary needs:
//! - Configuration management
//! - Logging infrastructure
//! - Registry data models and the on-disk registry service
//! - Crash-safe file writes and the registry file lock
//! - Media filtering for registry searches

pub mod config;
pub mod error;
pub mod filter;
pub mod fsutil;
pub mod logging;
pub mod models;
pub mod paths;
pub mod registry;

// Re-export commonly used types
pub use config::{Config, DownloadsConfig, RegistryConfig, WorkerConfig};
pub use error::{RegistryError, RegistryResult};
pub use filter::{MediaFilter, MediaSearchParams, MediaSearchResult, MediaSort, PageInfo};
pub use logging::LogConfig;
pub use models::*;
pub use paths::{DownloadPaths, RegistryPaths};
pub use registry::{
    DownloadStatistics, EpisodeUpdate, IndexEntryUpdate, RegistryService, RegistryStats,
};

/// Common result type using anyhow::Error
pub type Result<T> = anyhow::Result<T>;
