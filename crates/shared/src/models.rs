//! Data models for the media registry.
//!
//! This module defines the metadata snapshot copied in from the metadata API,
//! the per-media record documents, and the single registry index document.

use crate::error::RegistryError;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Registry schema version understood by this build.
pub const REGISTRY_VERSION: RegistryVersion = RegistryVersion::new(1, 0, 0);

/// Semantic version of the on-disk registry schema.
///
/// Only the major component gates compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegistryVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl RegistryVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether data written under `self` can be read by code expecting `other`.
    pub fn is_compatible_with(&self, other: &RegistryVersion) -> bool {
        self.major == other.major
    }
}

impl Default for RegistryVersion {
    fn default() -> Self {
        REGISTRY_VERSION
    }
}

impl std::fmt::Display for RegistryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for RegistryVersion {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(RegistryError::InvalidVersion(s.to_string()));
        }

        let mut components = [0u32; 3];
        for (slot, part) in components.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| RegistryError::InvalidVersion(s.to_string()))?;
        }

        Ok(Self::new(components[0], components[1], components[2]))
    }
}

impl TryFrom<String> for RegistryVersion {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RegistryVersion> for String {
    fn from(version: RegistryVersion) -> Self {
        version.to_string()
    }
}

// ========== Metadata snapshot ==========

/// Title variants reported by the metadata API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaTitle {
    pub romaji: Option<String>,
    pub english: Option<String>,
    pub native: Option<String>,
}

impl MediaTitle {
    /// Preferred display/search title (english first, then romaji)
    pub fn preferred(&self) -> Option<&str> {
        self.english
            .as_deref()
            .filter(|t| !t.is_empty())
            .or(self.romaji.as_deref().filter(|t| !t.is_empty()))
    }
}

/// Airing status of a title
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaStatus {
    Finished,
    Releasing,
    NotYetReleased,
    Cancelled,
    Hiatus,
}

/// Release format of a title
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaFormat {
    Tv,
    TvShort,
    Movie,
    Special,
    Ova,
    Ona,
    Music,
}

impl std::fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MediaFormat::Tv => "TV",
            MediaFormat::TvShort => "TV_SHORT",
            MediaFormat::Movie => "MOVIE",
            MediaFormat::Special => "SPECIAL",
            MediaFormat::Ova => "OVA",
            MediaFormat::Ona => "ONA",
            MediaFormat::Music => "MUSIC",
        };
        write!(f, "{}", s)
    }
}

/// Kind of media
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaType {
    #[default]
    Anime,
    Manga,
}

/// Tag attached to a title
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTag {
    pub name: String,
    #[serde(default)]
    pub rank: Option<u32>,
}

/// Metadata snapshot of a title, owned by the metadata API.
///
/// Copied into the record on access and never re-fetched by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: i64,
    #[serde(default)]
    pub id_mal: Option<i64>,
    #[serde(default)]
    pub title: MediaTitle,
    #[serde(default, rename = "type")]
    pub media_type: MediaType,
    #[serde(default)]
    pub status: Option<MediaStatus>,
    #[serde(default)]
    pub format: Option<MediaFormat>,

    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub episodes: Option<u32>,
    /// Episode length in minutes
    #[serde(default)]
    pub duration: Option<u32>,

    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub tags: Vec<MediaTag>,
    #[serde(default)]
    pub studios: Vec<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,

    #[serde(default)]
    pub average_score: Option<f64>,
    #[serde(default)]
    pub popularity: Option<u64>,
    #[serde(default)]
    pub favourites: Option<u64>,

    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl MediaItem {
    /// Minimal snapshot with only an id and a title
    pub fn new(id: i64, title: impl Into<String>) -> Self {
        Self {
            id,
            id_mal: None,
            title: MediaTitle {
                romaji: None,
                english: Some(title.into()),
                native: None,
            },
            media_type: MediaType::Anime,
            status: None,
            format: None,
            description: None,
            cover_image: None,
            episodes: None,
            duration: None,
            genres: Vec::new(),
            tags: Vec::new(),
            studios: Vec::new(),
            synonyms: Vec::new(),
            average_score: None,
            popularity: None,
            favourites: None,
            start_date: None,
            end_date: None,
        }
    }

    /// Human-readable title, falling back to the id
    pub fn display_title(&self) -> String {
        self.title
            .preferred()
            .map(str::to_string)
            .unwrap_or_else(|| format!("media {}", self.id))
    }

    /// Start year, if known
    pub fn year(&self) -> Option<i32> {
        self.start_date.map(|d| d.year())
    }
}

// ========== Registry records ==========

/// Per-episode download state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Paused,
}

impl DownloadStatus {
    pub const ALL: [DownloadStatus; 5] = [
        DownloadStatus::Queued,
        DownloadStatus::Downloading,
        DownloadStatus::Completed,
        DownloadStatus::Failed,
        DownloadStatus::Paused,
    ];

    /// Statuses that indicate an unfinished job
    pub fn is_unfinished(&self) -> bool {
        matches!(self, DownloadStatus::Queued | DownloadStatus::Downloading)
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadStatus::Queued => write!(f, "queued"),
            DownloadStatus::Downloading => write!(f, "downloading"),
            DownloadStatus::Completed => write!(f, "completed"),
            DownloadStatus::Failed => write!(f, "failed"),
            DownloadStatus::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(DownloadStatus::Queued),
            "downloading" => Ok(DownloadStatus::Downloading),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            "paused" => Ok(DownloadStatus::Paused),
            _ => Err(anyhow::anyhow!("Invalid download status: {}", s)),
        }
    }
}

/// Download detail for a single episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub episode_number: String,
    pub download_status: DownloadStatus,

    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub subtitle_paths: Vec<PathBuf>,

    /// Incremented only on transitions to FAILED
    #[serde(default)]
    pub download_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub download_date: Option<DateTime<Utc>>,
}

impl EpisodeRecord {
    pub fn new(episode_number: impl Into<String>, status: DownloadStatus) -> Self {
        Self {
            episode_number: episode_number.into(),
            download_status: status,
            file_path: None,
            file_size: None,
            quality: None,
            provider_name: None,
            server_name: None,
            subtitle_paths: Vec::new(),
            download_attempts: 0,
            last_error: None,
            download_date: None,
        }
    }
}

/// Full per-media document: metadata snapshot plus episode detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub media_item: MediaItem,
    #[serde(default)]
    pub media_episodes: Vec<EpisodeRecord>,
}

impl MediaRecord {
    pub fn new(media_item: MediaItem) -> Self {
        Self {
            media_item,
            media_episodes: Vec::new(),
        }
    }

    pub fn episode(&self, episode_number: &str) -> Option<&EpisodeRecord> {
        self.media_episodes
            .iter()
            .find(|e| e.episode_number == episode_number)
    }

    pub fn episode_mut(&mut self, episode_number: &str) -> Option<&mut EpisodeRecord> {
        self.media_episodes
            .iter_mut()
            .find(|e| e.episode_number == episode_number)
    }
}

// ========== Registry index ==========

/// User list status for a title
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserMediaListStatus {
    Watching,
    Planning,
    Completed,
    Dropped,
    Paused,
    Repeating,
}

impl std::fmt::Display for UserMediaListStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserMediaListStatus::Watching => write!(f, "watching"),
            UserMediaListStatus::Planning => write!(f, "planning"),
            UserMediaListStatus::Completed => write!(f, "completed"),
            UserMediaListStatus::Dropped => write!(f, "dropped"),
            UserMediaListStatus::Paused => write!(f, "paused"),
            UserMediaListStatus::Repeating => write!(f, "repeating"),
        }
    }
}

impl std::str::FromStr for UserMediaListStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "watching" => Ok(UserMediaListStatus::Watching),
            "planning" => Ok(UserMediaListStatus::Planning),
            "completed" => Ok(UserMediaListStatus::Completed),
            "dropped" => Ok(UserMediaListStatus::Dropped),
            "paused" => Ok(UserMediaListStatus::Paused),
            "repeating" => Ok(UserMediaListStatus::Repeating),
            _ => Err(anyhow::anyhow!("Invalid list status: {}", s)),
        }
    }
}

/// Lightweight summary of one title inside the index document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryIndexEntry {
    pub media_id: i64,
    pub media_api: String,

    #[serde(default)]
    pub status: Option<UserMediaListStatus>,
    #[serde(default = "default_progress")]
    pub progress: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub repeat: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,

    #[serde(default)]
    pub last_watch_position: Option<String>,
    #[serde(default)]
    pub total_duration: Option<String>,
    #[serde(default)]
    pub last_watched: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_notified_episode: Option<String>,
}

fn default_progress() -> String {
    "0".to_string()
}

impl RegistryIndexEntry {
    pub fn new(media_api: impl Into<String>, media_id: i64) -> Self {
        Self {
            media_id,
            media_api: media_api.into(),
            status: None,
            progress: default_progress(),
            score: None,
            repeat: None,
            notes: None,
            last_watch_position: None,
            total_duration: None,
            last_watched: None,
            last_notified_episode: None,
        }
    }

    /// Index key for a `(media_api, media_id)` pair
    pub fn key_for(media_api: &str, media_id: i64) -> String {
        format!("{}_{}", media_api, media_id)
    }

    pub fn key(&self) -> String {
        Self::key_for(&self.media_api, self.media_id)
    }
}

/// The singleton index document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryIndex {
    #[serde(default)]
    pub version: RegistryVersion,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub media_index: BTreeMap<String, RegistryIndexEntry>,
}

impl Default for RegistryIndex {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            last_updated: Utc::now(),
            media_index: BTreeMap::new(),
        }
    }
}

impl RegistryIndex {
    pub fn media_count(&self) -> usize {
        self.media_index.len()
    }

    /// Count of entries per user list status ("unset" when none)
    pub fn status_breakdown(&self) -> BTreeMap<String, usize> {
        let mut breakdown = BTreeMap::new();
        for entry in self.media_index.values() {
            let key = entry
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unset".to_string());
            *breakdown.entry(key).or_insert(0) += 1;
        }
        breakdown
    }

    /// Count of entries per metadata source
    pub fn media_count_breakdown(&self) -> BTreeMap<String, usize> {
        let mut breakdown = BTreeMap::new();
        for entry in self.media_index.values() {
            *breakdown.entry(entry.media_api.clone()).or_insert(0) += 1;
        }
        breakdown
    }
}
