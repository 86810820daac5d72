//! Configuration management for the anime downloader.
//!
//! This module handles loading and parsing configuration from TOML files,
//! with sensible defaults for all settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory settings
    pub data: DataConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Registry storage settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Download settings
    #[serde(default)]
    pub downloads: DownloadsConfig,

    /// Background worker settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Metadata API settings
    #[serde(default)]
    pub metadata_api: MetadataApiConfig,

    /// Content provider settings
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Data directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root data directory path
    pub root_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log directory path (relative to data directory or absolute)
    pub log_dir: String,

    /// Default log level (trace, debug, info, warn, error)
    pub default_level: String,

    /// Enable console output
    pub console: bool,

    /// Enable file output
    pub file: bool,

    /// Enable JSON formatting for file logs
    pub json_format: bool,
}

/// Registry storage configuration
///
/// Directories are already resolved when handed to `RegistryService`;
/// use [`Config::registry_config`] to get a resolved copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory holding per-media record files and the lock file
    pub media_dir: PathBuf,

    /// Directory holding the index document
    pub index_dir: PathBuf,

    /// Tag of the metadata source records are keyed under
    pub media_api: String,

    /// How long a mutation waits for the registry lock
    pub lock_timeout_seconds: u64,

    /// Holding the lock longer than this logs a warning
    pub lock_stale_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            media_dir: PathBuf::from("registry/media"),
            index_dir: PathBuf::from("registry"),
            media_api: "jikan".to_string(),
            lock_timeout_seconds: 30,
            lock_stale_seconds: 300,
        }
    }
}

impl RegistryConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_seconds)
    }
}

/// Download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadsConfig {
    /// Where finished episodes are written
    pub downloads_dir: PathBuf,

    /// Worker pool size
    pub max_concurrent_downloads: usize,

    /// Preferred stream quality, e.g. "1080"
    pub preferred_quality: String,

    /// "sub" or "dub"
    pub translation_type: String,

    /// Preferred provider server name (matched case-insensitively)
    #[serde(default)]
    pub server: Option<String>,

    /// Merge subtitles into the video container
    pub merge_subtitles: bool,

    /// Remove separate files after merging
    pub cleanup_after_merge: bool,

    /// FAILED episodes are retried until they reach this many attempts
    pub max_retry_attempts: u32,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from("downloads"),
            max_concurrent_downloads: 3,
            preferred_quality: "1080".to_string(),
            translation_type: "sub".to_string(),
            server: None,
            merge_subtitles: false,
            cleanup_after_merge: true,
            max_retry_attempts: 3,
        }
    }
}

/// Background worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Minutes between notification checks
    pub notification_check_interval_minutes: u64,

    /// Minutes between resuming unfinished downloads
    pub download_check_interval_minutes: u64,

    /// Minutes between retries of failed downloads
    pub failed_retry_interval_minutes: u64,

    /// Upper bound on a single sleep of the worker loop
    pub tick_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            notification_check_interval_minutes: 15,
            download_check_interval_minutes: 5,
            failed_retry_interval_minutes: 60,
            tick_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn notification_interval(&self) -> Duration {
        Duration::from_secs(self.notification_check_interval_minutes * 60)
    }

    pub fn download_interval(&self) -> Duration {
        Duration::from_secs(self.download_check_interval_minutes * 60)
    }

    pub fn failed_retry_interval(&self) -> Duration {
        Duration::from_secs(self.failed_retry_interval_minutes * 60)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }
}

/// Metadata API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataApiConfig {
    /// Jikan API base URL
    pub base_url: String,

    /// Rate limiting settings
    pub rate_limit: RateLimitConfig,

    /// Maximum retries for failed requests
    pub max_retries: u32,

    /// Retry delay in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for MetadataApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.jikan.moe/v4".to_string(),
            rate_limit: RateLimitConfig {
                requests_per_second: 2.0,
                requests_per_minute: 50,
            },
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    pub requests_per_second: f64,

    /// Maximum requests per minute
    pub requests_per_minute: u32,
}

/// External content provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name recorded on downloaded episodes
    pub name: String,

    /// Executable implementing the provider protocol
    pub command: String,

    /// Extra arguments placed before the subcommand
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "allanime".to_string(),
            command: "anime-provider".to_string(),
            args: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig {
                root_dir: "data".to_string(),
            },
            logging: LoggingConfig {
                log_dir: "logs".to_string(),
                default_level: "info".to_string(),
                console: true,
                file: true,
                json_format: false,
            },
            registry: RegistryConfig::default(),
            downloads: DownloadsConfig::default(),
            worker: WorkerConfig::default(),
            metadata_api: MetadataApiConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Load configuration from a TOML file or create default if not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::from_file(path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load config, using defaults");
            Self::default()
        })
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration saved successfully"
        );

        Ok(())
    }

    /// Get the absolute path for the data directory
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.root_dir)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }

    /// Get the absolute path for the log directory
    pub fn log_dir(&self) -> PathBuf {
        self.resolve(Path::new(&self.logging.log_dir))
    }

    pub fn media_dir(&self) -> PathBuf {
        self.resolve(&self.registry.media_dir)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.resolve(&self.registry.index_dir)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.resolve(&self.downloads.downloads_dir)
    }

    /// Registry settings with directories resolved against the data root
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            media_dir: self.media_dir(),
            index_dir: self.index_dir(),
            ..self.registry.clone()
        }
    }

    /// Download settings with the downloads directory resolved
    pub fn downloads_config(&self) -> DownloadsConfig {
        DownloadsConfig {
            downloads_dir: self.downloads_dir(),
            ..self.downloads.clone()
        }
    }
}
