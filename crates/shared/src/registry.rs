//! Local media registry: one index document plus one record file per title.
//!
//! All mutations run as read-modify-write under the registry file lock and
//! every file is replaced atomically. Reads skip the lock; an atomic rename
//! means a reader never sees a torn file.

use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::filter::{MediaFilter, MediaSearchParams, MediaSearchResult};
use crate::fsutil::{file_mtime, AtomicFileWriter, FileLock, FileLockGuard};
use crate::models::*;
use crate::paths::RegistryPaths;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

/// Changes to apply to an index entry. `None` means "leave unchanged".
#[derive(Debug, Clone, Default)]
pub struct IndexEntryUpdate {
    /// Stamp `last_watched` with the current time
    pub watched: bool,
    /// Create or refresh the record's metadata snapshot first
    pub media_item: Option<MediaItem>,
    pub progress: Option<String>,
    pub status: Option<UserMediaListStatus>,
    pub last_watch_position: Option<String>,
    pub total_duration: Option<String>,
    pub score: Option<f64>,
    pub repeat: Option<u32>,
    pub notes: Option<String>,
    pub last_notified_episode: Option<String>,
}

/// Episode metadata overlaid by a download status change
#[derive(Debug, Clone, Default)]
pub struct EpisodeUpdate {
    pub file_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub quality: Option<String>,
    pub provider_name: Option<String>,
    pub server_name: Option<String>,
    pub subtitle_paths: Option<Vec<PathBuf>>,
    pub error_message: Option<String>,
}

/// Aggregate counts across the whole registry
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_media: usize,
    pub media_api_breakdown: BTreeMap<String, usize>,
    pub status_breakdown: BTreeMap<String, usize>,
    pub format_breakdown: BTreeMap<String, usize>,
    pub genre_breakdown: BTreeMap<String, usize>,
    pub year_breakdown: BTreeMap<String, usize>,
    pub score_breakdown: BTreeMap<String, usize>,
    pub download_status_breakdown: BTreeMap<String, usize>,
    pub last_updated: DateTime<Utc>,
}

/// Download totals across all records
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DownloadStatistics {
    pub total_episodes: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub queued: usize,
    pub downloading: usize,
    pub paused: usize,
    pub total_size_bytes: u64,
    pub by_quality: BTreeMap<String, usize>,
    pub by_provider: BTreeMap<String, usize>,
}

struct CachedIndex {
    index: RegistryIndex,
    mtime: Option<SystemTime>,
}

/// Registry storage service
pub struct RegistryService {
    media_api: String,
    paths: RegistryPaths,
    lock: FileLock,
    index_cache: Mutex<Option<CachedIndex>>,
}

impl RegistryService {
    /// Create a registry service for one metadata source.
    ///
    /// Directory creation failures are logged, not returned; later
    /// operations report their own errors.
    pub fn new(media_api: impl Into<String>, config: &RegistryConfig) -> Self {
        let media_api = media_api.into();
        let paths = RegistryPaths::new(&config.media_dir, &config.index_dir);

        if let Err(e) = paths.create_dirs(&media_api) {
            error!(
                media_dir = %paths.media_dir().display(),
                index_dir = %paths.index_dir().display(),
                error = %e,
                "Failed to create registry directories"
            );
        }

        let lock = FileLock::new(
            paths.lock_file(),
            config.lock_timeout(),
            config.lock_stale_after(),
        );

        Self {
            media_api,
            paths,
            lock,
            index_cache: Mutex::new(None),
        }
    }

    pub fn media_api(&self) -> &str {
        &self.media_api
    }

    pub fn paths(&self) -> &RegistryPaths {
        &self.paths
    }

    fn key(&self, media_id: i64) -> String {
        RegistryIndexEntry::key_for(&self.media_api, media_id)
    }

    fn record_file(&self, media_id: i64) -> PathBuf {
        self.paths.record_file(&self.media_api, media_id)
    }

    fn cache(&self) -> MutexGuard<'_, Option<CachedIndex>> {
        self.index_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========== Index ==========

    /// Load the index, creating and persisting an empty one if absent.
    ///
    /// The cached copy is reused until the file's mtime changes. Fails with
    /// [`RegistryError::IncompatibleVersion`] when the stored major version
    /// differs; the file is left untouched.
    pub fn load_index(&self) -> RegistryResult<RegistryIndex> {
        if let Some(index) = self.read_index()? {
            return Ok(index);
        }

        let guard = self.lock.acquire()?;
        // Another writer may have created it while we waited
        match self.read_index()? {
            Some(index) => Ok(index),
            None => {
                info!(path = %self.paths.index_file().display(), "Creating registry index");
                self.write_index(&guard, RegistryIndex::default())
            }
        }
    }

    /// Read the index from cache or disk; `None` when the file doesn't exist
    fn read_index(&self) -> RegistryResult<Option<RegistryIndex>> {
        let index_file = self.paths.index_file();
        let mtime = file_mtime(&index_file);

        {
            let cache = self.cache();
            if let Some(cached) = cache.as_ref() {
                if mtime.is_some() && cached.mtime == mtime {
                    return Ok(Some(cached.index.clone()));
                }
            }
        }

        let content = match fs::read_to_string(&index_file) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                *self.cache() = None;
                return Ok(None);
            }
            Err(e) => return Err(RegistryError::io(&index_file, e)),
        };

        let index = parse_index(&index_file, &content)?;
        debug!(entries = index.media_count(), "Loaded registry index");

        *self.cache() = Some(CachedIndex {
            index: index.clone(),
            mtime,
        });
        Ok(Some(index))
    }

    /// Index for a read-modify-write; the caller holds the lock
    fn load_index_locked(&self, _guard: &FileLockGuard) -> RegistryResult<RegistryIndex> {
        Ok(self.read_index()?.unwrap_or_default())
    }

    fn write_index(
        &self,
        _guard: &FileLockGuard,
        mut index: RegistryIndex,
    ) -> RegistryResult<RegistryIndex> {
        let index_file = self.paths.index_file();
        index.last_updated = Utc::now();
        AtomicFileWriter::write_json(&index_file, &index)?;

        *self.cache() = Some(CachedIndex {
            index: index.clone(),
            mtime: file_mtime(&index_file),
        });

        debug!(entries = index.media_count(), "Saved registry index");
        Ok(index)
    }

    pub fn get_media_index_entry(&self, media_id: i64) -> RegistryResult<Option<RegistryIndexEntry>> {
        let index = self.load_index()?;
        Ok(index.media_index.get(&self.key(media_id)).cloned())
    }

    pub fn get_or_create_index_entry(&self, media_id: i64) -> RegistryResult<RegistryIndexEntry> {
        if let Some(entry) = self.get_media_index_entry(media_id)? {
            return Ok(entry);
        }

        let guard = self.lock.acquire()?;
        self.ensure_index_entry_locked(&guard, media_id)
    }

    fn ensure_index_entry_locked(
        &self,
        guard: &FileLockGuard,
        media_id: i64,
    ) -> RegistryResult<RegistryIndexEntry> {
        let mut index = self.load_index_locked(guard)?;
        let key = self.key(media_id);

        if let Some(entry) = index.media_index.get(&key) {
            return Ok(entry.clone());
        }

        let entry = RegistryIndexEntry::new(&self.media_api, media_id);
        index.media_index.insert(key, entry.clone());
        self.write_index(guard, index)?;

        debug!(media_id, "Created index entry");
        Ok(entry)
    }

    /// Insert or replace an index entry
    pub fn save_media_index_entry(&self, mut entry: RegistryIndexEntry) -> RegistryResult<()> {
        let guard = self.lock.acquire()?;
        let mut index = self.load_index_locked(&guard)?;

        entry.media_api = self.media_api.clone();
        index.media_index.insert(self.key(entry.media_id), entry);
        self.write_index(&guard, index)?;
        Ok(())
    }

    /// Apply an update to one index entry, creating it if needed
    pub fn update_media_index_entry(
        &self,
        media_id: i64,
        update: IndexEntryUpdate,
    ) -> RegistryResult<RegistryIndexEntry> {
        let guard = self.lock.acquire()?;

        let media_item = match update.media_item {
            Some(item) => Some(self.upsert_record_locked(&guard, item)?.media_item),
            None => self.get_media_record(media_id)?.map(|r| r.media_item),
        };

        let mut index = self.load_index_locked(&guard)?;
        let key = self.key(media_id);
        let entry = index
            .media_index
            .entry(key)
            .or_insert_with(|| RegistryIndexEntry::new(&self.media_api, media_id));

        if let Some(progress) = update.progress {
            let total_episodes = media_item.as_ref().and_then(|m| m.episodes);
            entry.progress = match (update.status, total_episodes) {
                (Some(UserMediaListStatus::Completed), Some(total)) => total.to_string(),
                _ => progress,
            };
        }

        entry.status = update.status.or(entry.status).or(Some(UserMediaListStatus::Watching));

        if let Some(position) = update.last_watch_position {
            entry.last_watch_position = Some(position);
        }
        if let Some(duration) = update.total_duration {
            entry.total_duration = Some(duration);
        }
        if let Some(score) = update.score {
            entry.score = Some(score);
        }
        if let Some(repeat) = update.repeat {
            entry.repeat = Some(repeat);
        }
        if let Some(notes) = update.notes {
            entry.notes = Some(notes);
        }
        if let Some(episode) = update.last_notified_episode {
            entry.last_notified_episode = Some(episode);
        }
        if update.watched {
            entry.last_watched = Some(Utc::now());
        }

        let updated = entry.clone();
        self.write_index(&guard, index)?;

        debug!(media_id, progress = %updated.progress, "Updated index entry");
        Ok(updated)
    }

    // ========== Records ==========

    /// Read a record; `None` when no file exists for the id
    pub fn get_media_record(&self, media_id: i64) -> RegistryResult<Option<MediaRecord>> {
        read_record(&self.record_file(media_id))
    }

    /// Return the record for `media_item`, creating it if absent.
    ///
    /// An existing record gets its metadata snapshot replaced. Either way
    /// the record and its index entry are persisted.
    pub fn get_or_create_record(&self, media_item: &MediaItem) -> RegistryResult<MediaRecord> {
        let guard = self.lock.acquire()?;
        self.upsert_record_locked(&guard, media_item.clone())
    }

    fn upsert_record_locked(
        &self,
        guard: &FileLockGuard,
        media_item: MediaItem,
    ) -> RegistryResult<MediaRecord> {
        let record = match self.get_media_record(media_item.id)? {
            Some(mut record) => {
                record.media_item = media_item;
                record
            }
            None => {
                debug!(media_id = media_item.id, "Creating media record");
                MediaRecord::new(media_item)
            }
        };

        self.save_record_locked(guard, &record)?;
        Ok(record)
    }

    /// Persist a record and make sure its index entry exists
    pub fn save_media_record(&self, record: &MediaRecord) -> RegistryResult<()> {
        let guard = self.lock.acquire()?;
        self.save_record_locked(&guard, record)
    }

    fn save_record_locked(&self, guard: &FileLockGuard, record: &MediaRecord) -> RegistryResult<()> {
        let media_id = record.media_item.id;

        // Validates the index version before anything is written
        self.ensure_index_entry_locked(guard, media_id)?;
        AtomicFileWriter::write_json(self.record_file(media_id), record)?;

        debug!(media_id, episodes = record.media_episodes.len(), "Saved media record");
        Ok(())
    }

    /// Set an episode's download status, overlaying any supplied metadata.
    ///
    /// `download_attempts` is incremented exactly when `status` is FAILED.
    /// Returns `Ok(false)` when no record exists for `media_id`.
    pub fn update_episode_download_status(
        &self,
        media_id: i64,
        episode_number: &str,
        status: DownloadStatus,
        update: EpisodeUpdate,
    ) -> RegistryResult<bool> {
        let guard = self.lock.acquire()?;

        let Some(mut record) = self.get_media_record(media_id)? else {
            warn!(media_id, episode = %episode_number, "No media record for episode update");
            return Ok(false);
        };

        if record.episode(episode_number).is_none() {
            record
                .media_episodes
                .push(EpisodeRecord::new(episode_number, status));
        }

        if let Some(episode) = record.episode_mut(episode_number) {
            episode.download_status = status;

            if let Some(path) = update.file_path {
                episode.file_path = Some(path);
            }
            if let Some(size) = update.file_size {
                episode.file_size = Some(size);
            }
            if let Some(quality) = update.quality {
                episode.quality = Some(quality);
            }
            if let Some(provider) = update.provider_name {
                episode.provider_name = Some(provider);
            }
            if let Some(server) = update.server_name {
                episode.server_name = Some(server);
            }
            if let Some(subtitles) = update.subtitle_paths {
                episode.subtitle_paths = subtitles;
            }
            if let Some(message) = update.error_message {
                episode.last_error = Some(message);
            }

            match status {
                DownloadStatus::Failed => episode.download_attempts += 1,
                DownloadStatus::Completed => episode.download_date = Some(Utc::now()),
                _ => {}
            }
        }

        self.save_record_locked(&guard, &record)?;

        debug!(media_id, episode = %episode_number, status = %status, "Updated episode status");
        Ok(true)
    }

    /// Remove one episode entry from a record; `Ok(false)` if it wasn't there
    pub fn remove_episode(&self, media_id: i64, episode_number: &str) -> RegistryResult<bool> {
        let guard = self.lock.acquire()?;

        let Some(mut record) = self.get_media_record(media_id)? else {
            return Ok(false);
        };

        let before = record.media_episodes.len();
        record
            .media_episodes
            .retain(|e| e.episode_number != episode_number);
        if record.media_episodes.len() == before {
            return Ok(false);
        }

        self.save_record_locked(&guard, &record)?;
        Ok(true)
    }

    /// Every readable record; junk files in the media directory are skipped
    pub fn get_all_media_records(&self) -> RegistryResult<Vec<MediaRecord>> {
        let api_dir = self.paths.api_dir(&self.media_api);
        let entries = match fs::read_dir(&api_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RegistryError::io(&api_dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(dir = %api_dir.display(), error = %e, "Failed to read directory entry");
                    continue;
                }
            };

            if path.is_dir() {
                warn!(path = %path.display(), "Ignoring unexpected directory in registry");
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let Some(media_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
            else {
                warn!(path = %path.display(), "Ignoring non-record file in registry");
                continue;
            };

            match read_record(&path) {
                Ok(Some(record)) if record.media_item.id == media_id => records.push(record),
                Ok(Some(_)) => {
                    warn!(path = %path.display(), "Record id does not match its file name");
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }

        records.sort_by_key(|r| r.media_item.id);
        Ok(records)
    }

    /// `(media_id, episode_number)` of every episode with `status`
    pub fn get_episodes_by_download_status(
        &self,
        status: DownloadStatus,
    ) -> RegistryResult<Vec<(i64, String)>> {
        Ok(self
            .get_all_media_records()?
            .into_iter()
            .flat_map(|record| {
                let media_id = record.media_item.id;
                record
                    .media_episodes
                    .into_iter()
                    .filter(move |e| e.download_status == status)
                    .map(move |e| (media_id, e.episode_number))
            })
            .collect())
    }

    /// Delete a record file and its index entry. Idempotent.
    pub fn remove_media_record(&self, media_id: i64) -> RegistryResult<()> {
        let guard = self.lock.acquire()?;
        let record_file = self.record_file(media_id);

        match fs::remove_file(&record_file) {
            Ok(()) => {
                if let Some(parent) = record_file.parent() {
                    // Only succeeds once the directory is empty
                    let _ = fs::remove_dir(parent);
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(RegistryError::io(&record_file, e)),
        }

        let mut index = self.load_index_locked(&guard)?;
        if index.media_index.remove(&self.key(media_id)).is_some() {
            self.write_index(&guard, index)?;
        }

        info!(media_id, "Removed media record");
        Ok(())
    }

    // ========== Queries ==========

    /// Most recently watched media first; never-watched entries last
    pub fn get_recently_watched(&self, limit: usize) -> RegistryResult<Vec<MediaItem>> {
        let index = self.load_index()?;
        let mut entries: Vec<&RegistryIndexEntry> = index.media_index.values().collect();
        sort_recent_first(&mut entries);

        let mut media = Vec::new();
        for entry in entries {
            if media.len() >= limit {
                break;
            }
            if let Some(record) = self.get_media_record(entry.media_id)? {
                media.push(record.media_item);
            }
        }
        Ok(media)
    }

    /// Media whose list status is `status`, most recently watched first
    pub fn get_media_by_status(&self, status: UserMediaListStatus) -> RegistryResult<Vec<MediaItem>> {
        let index = self.load_index()?;
        let mut entries: Vec<&RegistryIndexEntry> = index
            .media_index
            .values()
            .filter(|e| e.status == Some(status))
            .collect();
        sort_recent_first(&mut entries);

        let mut media = Vec::new();
        for entry in entries {
            if let Some(record) = self.get_media_record(entry.media_id)? {
                media.push(record.media_item);
            }
        }
        Ok(media)
    }

    /// `media_id -> last_notified_episode` for every entry that has one
    pub fn get_seen_notifications(&self) -> RegistryResult<HashMap<i64, String>> {
        let index = self.load_index()?;
        Ok(index
            .media_index
            .values()
            .filter_map(|e| e.last_notified_episode.clone().map(|ep| (e.media_id, ep)))
            .collect())
    }

    /// Filter, sort and page over the stored metadata snapshots
    pub fn search_for_media(&self, params: &MediaSearchParams) -> RegistryResult<MediaSearchResult> {
        let items = self
            .get_all_media_records()?
            .into_iter()
            .map(|r| r.media_item)
            .collect();
        Ok(MediaFilter::search(items, params))
    }

    /// Registry-wide breakdowns, computed on demand
    pub fn get_registry_stats(&self) -> RegistryResult<RegistryStats> {
        let index = self.load_index()?;
        let records = self.get_all_media_records()?;

        let mut format_breakdown = BTreeMap::new();
        let mut genre_breakdown = BTreeMap::new();
        let mut year_breakdown = BTreeMap::new();
        let mut score_breakdown = BTreeMap::new();
        let mut download_status_breakdown = BTreeMap::new();

        for record in &records {
            let item = &record.media_item;

            let format = item
                .format
                .map(|f| f.to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            *format_breakdown.entry(format).or_insert(0) += 1;

            for genre in &item.genres {
                *genre_breakdown.entry(genre.clone()).or_insert(0) += 1;
            }

            if let Some(year) = item.year() {
                *year_breakdown.entry(year.to_string()).or_insert(0) += 1;
            }

            if let Some(score) = item.average_score {
                *score_breakdown.entry(score_bucket(score)).or_insert(0) += 1;
            }

            for episode in &record.media_episodes {
                *download_status_breakdown
                    .entry(episode.download_status.to_string())
                    .or_insert(0) += 1;
            }
        }

        Ok(RegistryStats {
            total_media: index.media_count(),
            media_api_breakdown: index.media_count_breakdown(),
            status_breakdown: index.status_breakdown(),
            format_breakdown,
            genre_breakdown,
            year_breakdown,
            score_breakdown,
            download_status_breakdown,
            last_updated: index.last_updated,
        })
    }

    pub fn get_download_statistics(&self) -> RegistryResult<DownloadStatistics> {
        let mut stats = DownloadStatistics::default();

        for record in self.get_all_media_records()? {
            for episode in &record.media_episodes {
                stats.total_episodes += 1;
                match episode.download_status {
                    DownloadStatus::Completed => stats.downloaded += 1,
                    DownloadStatus::Failed => stats.failed += 1,
                    DownloadStatus::Queued => stats.queued += 1,
                    DownloadStatus::Downloading => stats.downloading += 1,
                    DownloadStatus::Paused => stats.paused += 1,
                }

                stats.total_size_bytes += episode.file_size.unwrap_or(0);

                if let Some(quality) = &episode.quality {
                    *stats.by_quality.entry(quality.clone()).or_insert(0) += 1;
                }
                if let Some(provider) = &episode.provider_name {
                    *stats.by_provider.entry(provider.clone()).or_insert(0) += 1;
                }
            }
        }

        Ok(stats)
    }
}

/// Parse an index document, refusing incompatible major versions
fn parse_index(path: &Path, content: &str) -> RegistryResult<RegistryIndex> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| RegistryError::json(path, e))?;

    // Check the version before the body so a newer schema fails cleanly
    if let Some(raw) = value.get("version").and_then(|v| v.as_str()) {
        let found: RegistryVersion = raw.parse()?;
        if !found.is_compatible_with(&REGISTRY_VERSION) {
            error!(
                path = %path.display(),
                found = %found,
                expected = %REGISTRY_VERSION,
                "Incompatible registry version"
            );
            return Err(RegistryError::IncompatibleVersion {
                found,
                expected: REGISTRY_VERSION,
            });
        }
    }

    serde_json::from_value(value).map_err(|e| RegistryError::json(path, e))
}

fn read_record(path: &Path) -> RegistryResult<Option<MediaRecord>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RegistryError::io(path, e)),
    };

    let record = serde_json::from_str(&content).map_err(|e| RegistryError::json(path, e))?;
    Ok(Some(record))
}

fn sort_recent_first(entries: &mut [&RegistryIndexEntry]) {
    // None < Some, so reversing puts never-watched entries last
    entries.sort_by(|a, b| b.last_watched.cmp(&a.last_watched));
}

/// Score bucket label: "0-9", "10-19", ... "90-100"
fn score_bucket(score: f64) -> String {
    let bucket = ((score.max(0.0) / 10.0).floor() as u32).min(9);
    if bucket == 9 {
        "90-100".to_string()
    } else {
        format!("{}-{}", bucket * 10, bucket * 10 + 9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{MediaSort, SortField};
    use anyhow::Result;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> RegistryConfig {
        RegistryConfig {
            media_dir: dir.path().join("media"),
            index_dir: dir.path().join("index"),
            media_api: "test".to_string(),
            lock_timeout_seconds: 10,
            lock_stale_seconds: 60,
        }
    }

    fn registry(dir: &TempDir) -> RegistryService {
        RegistryService::new("test", &test_config(dir))
    }

    fn record_files(registry: &RegistryService) -> Result<Vec<PathBuf>> {
        Ok(fs::read_dir(registry.paths().api_dir("test"))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect())
    }

    #[test]
    fn test_fresh_registry() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = registry(&temp_dir);

        assert!(!registry.paths().index_file().exists());
        let index = registry.load_index()?;
        assert_eq!(index.media_count(), 0);
        assert!(registry.paths().index_file().exists());

        registry.get_or_create_record(&MediaItem::new(42, "Frieren"))?;

        assert_eq!(record_files(&registry)?, vec![registry.paths().record_file("test", 42)]);
        let index = registry.load_index()?;
        assert_eq!(index.media_count(), 1);
        assert!(index.media_index.contains_key("test_42"));
        Ok(())
    }

    #[test]
    fn test_round_trip_across_restart() -> Result<()> {
        let temp_dir = TempDir::new()?;
        {
            let registry = registry(&temp_dir);
            let mut record = MediaRecord::new(MediaItem::new(7, "Mushishi"));

            let mut done = EpisodeRecord::new("1", DownloadStatus::Completed);
            done.file_path = Some(PathBuf::from("/downloads/Mushishi/1.mp4"));
            done.download_attempts = 2;
            record.media_episodes.push(done);
            record
                .media_episodes
                .push(EpisodeRecord::new("2", DownloadStatus::Queued));

            registry.save_media_record(&record)?;
        }

        let registry = registry(&temp_dir);
        let record = registry.get_media_record(7)?.expect("record should exist");

        let first = record.episode("1").expect("episode 1");
        assert_eq!(first.download_status, DownloadStatus::Completed);
        assert_eq!(first.file_path, Some(PathBuf::from("/downloads/Mushishi/1.mp4")));
        assert_eq!(first.download_attempts, 2);

        let second = record.episode("2").expect("episode 2");
        assert_eq!(second.download_status, DownloadStatus::Queued);
        assert_eq!(second.file_path, None);
        assert_eq!(second.download_attempts, 0);
        Ok(())
    }

    #[test]
    fn test_get_or_create_record_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = registry(&temp_dir);

        registry.get_or_create_record(&MediaItem::new(5, "Old Title"))?;
        let record = registry.get_or_create_record(&MediaItem::new(5, "New Title"))?;

        assert_eq!(record.media_item.display_title(), "New Title");
        assert_eq!(record_files(&registry)?.len(), 1);
        let stored = registry.get_media_record(5)?.expect("record should exist");
        assert_eq!(stored.media_item.display_title(), "New Title");
        assert_eq!(registry.load_index()?.media_count(), 1);
        Ok(())
    }

    #[test]
    fn test_incompatible_version_is_fatal_and_untouched() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = registry(&temp_dir);
        let index_file = registry.paths().index_file();

        let future = r#"{"version": "2.0.0", "last_updated": "2026-01-01T00:00:00Z", "media_index": {}, "shape": "new"}"#;
        fs::write(&index_file, future)?;

        let err = registry.load_index().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, RegistryError::IncompatibleVersion { .. }));

        let err = registry
            .get_or_create_record(&MediaItem::new(1, "Anything"))
            .unwrap_err();
        assert!(err.is_fatal());

        assert_eq!(fs::read_to_string(&index_file)?, future);
        assert!(registry.get_media_record(1)?.is_none());
        Ok(())
    }

    #[test]
    fn test_legacy_two_component_version_loads() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = registry(&temp_dir);
        fs::write(
            registry.paths().index_file(),
            r#"{"version": "1.0", "last_updated": "2025-06-01T12:00:00Z", "media_index": {}}"#,
        )?;

        let index = registry.load_index()?;
        assert_eq!(index.version, RegistryVersion::new(1, 0, 0));
        Ok(())
    }

    #[test]
    fn test_index_reloads_after_external_write() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let first = registry(&temp_dir);
        let second = registry(&temp_dir);

        assert_eq!(first.load_index()?.media_count(), 0);
        thread::sleep(std::time::Duration::from_millis(20));
        second.get_or_create_index_entry(9)?;

        assert!(first.get_media_index_entry(9)?.is_some());
        Ok(())
    }

    #[test]
    fn test_download_attempts_increment_only_on_failure() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = registry(&temp_dir);
        registry.get_or_create_record(&MediaItem::new(3, "Dorohedoro"))?;

        for _ in 0..2 {
            let updated = registry.update_episode_download_status(
                3,
                "4",
                DownloadStatus::Failed,
                EpisodeUpdate {
                    error_message: Some("no servers".to_string()),
                    ..Default::default()
                },
            )?;
            assert!(updated);
        }

        registry.update_episode_download_status(
            3,
            "4",
            DownloadStatus::Completed,
            EpisodeUpdate {
                file_size: Some(1024),
                quality: Some("1080".to_string()),
                ..Default::default()
            },
        )?;

        let record = registry.get_media_record(3)?.expect("record should exist");
        assert_eq!(record.media_episodes.len(), 1);
        let episode = record.episode("4").expect("episode 4");
        assert_eq!(episode.download_status, DownloadStatus::Completed);
        assert_eq!(episode.download_attempts, 2);
        assert_eq!(episode.file_size, Some(1024));
        assert!(episode.download_date.is_some());

        assert!(!registry.update_episode_download_status(
            999,
            "1",
            DownloadStatus::Queued,
            EpisodeUpdate::default()
        )?);
        Ok(())
    }

    #[test]
    fn test_update_index_entry_semantics() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = registry(&temp_dir);
        let mut item = MediaItem::new(11, "Vinland Saga");
        item.episodes = Some(24);

        let entry = registry.update_media_index_entry(
            11,
            IndexEntryUpdate {
                media_item: Some(item),
                progress: Some("3".to_string()),
                ..Default::default()
            },
        )?;
        assert_eq!(entry.status, Some(UserMediaListStatus::Watching));
        assert_eq!(entry.progress, "3");
        assert!(entry.last_watched.is_none());
        assert!(registry.get_media_record(11)?.is_some());

        // None leaves fields alone
        let entry = registry.update_media_index_entry(
            11,
            IndexEntryUpdate {
                watched: true,
                score: Some(9.5),
                ..Default::default()
            },
        )?;
        assert_eq!(entry.progress, "3");
        assert_eq!(entry.score, Some(9.5));
        assert!(entry.last_watched.is_some());

        let entry = registry.update_media_index_entry(
            11,
            IndexEntryUpdate {
                status: Some(UserMediaListStatus::Completed),
                progress: Some("20".to_string()),
                ..Default::default()
            },
        )?;
        assert_eq!(entry.status, Some(UserMediaListStatus::Completed));
        assert_eq!(entry.progress, "24");
        Ok(())
    }

    #[test]
    fn test_remove_media_record_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = registry(&temp_dir);
        registry.get_or_create_record(&MediaItem::new(8, "Monster"))?;

        registry.remove_media_record(8)?;
        assert!(registry.get_media_record(8)?.is_none());
        assert!(registry.get_media_index_entry(8)?.is_none());
        assert!(!registry.paths().api_dir("test").exists());

        registry.remove_media_record(8)?;
        Ok(())
    }

    #[test]
    fn test_all_records_skip_junk() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = registry(&temp_dir);
        registry.get_or_create_record(&MediaItem::new(1, "Kept"))?;

        let api_dir = registry.paths().api_dir("test");
        fs::create_dir_all(api_dir.join("stray"))?;
        fs::write(api_dir.join("2.json"), "{not json")?;
        fs::write(api_dir.join("notes.json"), "{}")?;
        fs::write(api_dir.join("README"), "hello")?;

        let records = registry.get_all_media_records()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].media_item.id, 1);
        Ok(())
    }

    #[test]
    fn test_statistics() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = registry(&temp_dir);

        let mut item = MediaItem::new(1, "Cowboy Bebop");
        item.format = Some(MediaFormat::Tv);
        item.genres = vec!["Action".to_string(), "Sci-Fi".to_string()];
        item.average_score = Some(86.0);
        item.start_date = chrono::NaiveDate::from_ymd_opt(1998, 4, 3);
        registry.get_or_create_record(&item)?;

        let mut movie = MediaItem::new(2, "Perfect Blue");
        movie.format = Some(MediaFormat::Movie);
        movie.average_score = Some(100.0);
        registry.get_or_create_record(&movie)?;

        let done = EpisodeUpdate {
            file_size: Some(500),
            quality: Some("720".to_string()),
            provider_name: Some("allanime".to_string()),
            ..Default::default()
        };
        registry.update_episode_download_status(1, "1", DownloadStatus::Completed, done.clone())?;
        registry.update_episode_download_status(1, "2", DownloadStatus::Completed, done)?;
        registry.update_episode_download_status(1, "3", DownloadStatus::Failed, EpisodeUpdate::default())?;
        registry.update_episode_download_status(2, "1", DownloadStatus::Queued, EpisodeUpdate::default())?;

        let stats = registry.get_registry_stats()?;
        assert_eq!(stats.total_media, 2);
        assert_eq!(stats.media_api_breakdown.get("test"), Some(&2));
        assert_eq!(stats.format_breakdown.get("TV"), Some(&1));
        assert_eq!(stats.format_breakdown.get("MOVIE"), Some(&1));
        assert_eq!(stats.genre_breakdown.get("Sci-Fi"), Some(&1));
        assert_eq!(stats.year_breakdown.get("1998"), Some(&1));
        assert_eq!(stats.score_breakdown.get("80-89"), Some(&1));
        assert_eq!(stats.score_breakdown.get("90-100"), Some(&1));
        assert_eq!(stats.download_status_breakdown.get("completed"), Some(&2));

        let downloads = registry.get_download_statistics()?;
        assert_eq!(downloads.total_episodes, 4);
        assert_eq!(downloads.downloaded, 2);
        assert_eq!(downloads.failed, 1);
        assert_eq!(downloads.queued, 1);
        assert_eq!(downloads.total_size_bytes, 1000);
        assert_eq!(downloads.by_quality.get("720"), Some(&2));
        assert_eq!(downloads.by_provider.get("allanime"), Some(&2));

        assert_eq!(
            registry.get_episodes_by_download_status(DownloadStatus::Completed)?,
            vec![(1, "1".to_string()), (1, "2".to_string())]
        );
        Ok(())
    }

    #[test]
    fn test_search_and_watch_queries() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = registry(&temp_dir);

        for (id, title, score) in [(1, "Haikyu", 80.0), (2, "Hyouka", 90.0), (3, "K-On", 70.0)] {
            let mut item = MediaItem::new(id, title);
            item.average_score = Some(score);
            registry.get_or_create_record(&item)?;
        }

        let result = registry.search_for_media(&MediaSearchParams {
            query: Some("h".to_string()),
            sort: vec![MediaSort::desc(SortField::Score)],
            ..Default::default()
        })?;
        let ids: Vec<i64> = result.media.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(result.page_info.total, 2);

        registry.update_media_index_entry(
            3,
            IndexEntryUpdate {
                watched: true,
                last_notified_episode: Some("12".to_string()),
                ..Default::default()
            },
        )?;
        thread::sleep(std::time::Duration::from_millis(5));
        registry.update_media_index_entry(
            1,
            IndexEntryUpdate {
                watched: true,
                status: Some(UserMediaListStatus::Paused),
                ..Default::default()
            },
        )?;

        let recent: Vec<i64> = registry.get_recently_watched(2)?.iter().map(|m| m.id).collect();
        assert_eq!(recent, vec![1, 3]);

        let paused = registry.get_media_by_status(UserMediaListStatus::Paused)?;
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].id, 1);

        let seen = registry.get_seen_notifications()?;
        assert_eq!(seen.get(&3).map(String::as_str), Some("12"));
        assert_eq!(seen.len(), 1);
        Ok(())
    }

    #[test]
    fn test_concurrent_episode_updates_are_serialized() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = Arc::new(registry(&temp_dir));
        registry.get_or_create_record(&MediaItem::new(1, "One Piece"))?;

        let handles: Vec<_> = (1..=8)
            .map(|ep| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    registry.update_episode_download_status(
                        1,
                        &ep.to_string(),
                        DownloadStatus::Queued,
                        EpisodeUpdate::default(),
                    )
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().expect("thread panicked")?);
        }

        let record = registry.get_media_record(1)?.expect("record should exist");
        assert_eq!(record.media_episodes.len(), 8);
        Ok(())
    }

    #[test]
    fn test_score_buckets() {
        assert_eq!(score_bucket(0.0), "0-9");
        assert_eq!(score_bucket(45.5), "40-49");
        assert_eq!(score_bucket(99.0), "90-100");
        assert_eq!(score_bucket(100.0), "90-100");
    }
}
