//! Download orchestration.
//!
//! [`DownloadService`] turns `(media, episode)` requests into download jobs
//! on a bounded pool, and records every state transition in the registry:
//!
//! ```text
//! QUEUED -> DOWNLOADING -> COMPLETED
//!                       -> FAILED  (download_attempts += 1)
//! ```
//!
//! A failing job never affects other jobs. An episode has at most one job
//! in flight per process; anything left QUEUED or DOWNLOADING by a crash is
//! picked up again by [`DownloadService::resume_unfinished_downloads`].

use crate::downloader::{DownloadParams, Downloader};
use crate::error::JobError;
use crate::provider::{
    best_match, ContentProvider, EpisodeStreamsParams, SearchParams, Server, TranslationType,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use shared::{
    DownloadStatistics, DownloadStatus, DownloadsConfig, EpisodeUpdate, MediaItem, RegistryResult,
    RegistryService,
};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type JobKey = (i64, String);

/// What a successful job hands back to be recorded
#[derive(Debug, Clone)]
pub struct CompletedDownload {
    pub file_path: PathBuf,
    pub file_size: Option<u64>,
    pub quality: String,
    pub server_name: String,
    pub subtitle_paths: Vec<PathBuf>,
}

/// Outcome of a submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Submission {
    Spawned,
    AlreadyInFlight,
    AlreadyDownloaded,
    Rejected,
}

impl Submission {
    fn accepted(self) -> bool {
        self != Submission::Rejected
    }
}

/// Episodes currently owned by a job in this process
#[derive(Debug, Default)]
struct InFlight(Mutex<HashSet<JobKey>>);

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<JobKey>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn contains(&self, key: &JobKey) -> bool {
        self.lock().contains(key)
    }

    /// Claim `key`; `None` if another job owns it
    fn claim(self: &Arc<Self>, key: JobKey) -> Option<InFlightGuard> {
        if !self.lock().insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: Arc::clone(self),
            key,
        })
    }
}

/// Releases the claim when the job ends, panics included
struct InFlightGuard {
    in_flight: Arc<InFlight>,
    key: JobKey,
}

impl InFlightGuard {
    /// Release the claim, then take it back if the episode was re-queued
    /// while the job ran. A submission that found the episode in flight
    /// only records QUEUED, so the finishing job has to pick it up.
    fn release_unless_requeued(self, registry: &RegistryService) -> Option<InFlightGuard> {
        let in_flight = Arc::clone(&self.in_flight);
        let key = self.key.clone();
        drop(self);

        let requeued = matches!(
            registry.get_media_record(key.0),
            Ok(Some(record)) if record
                .episode(&key.1)
                .is_some_and(|e| e.download_status == DownloadStatus::Queued)
        );
        if !requeued {
            return None;
        }
        in_flight.claim(key)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// The part of the service a spawned job needs
struct JobRunner {
    config: DownloadsConfig,
    translation_type: TranslationType,
    registry: Arc<RegistryService>,
    provider: Arc<dyn ContentProvider>,
    downloader: Arc<dyn Downloader>,
}

impl JobRunner {
    /// Run the job owning `claim`, again for as long as it gets re-queued
    async fn run_claimed(&self, mut claim: InFlightGuard, media_item: &MediaItem, episode: &str) -> bool {
        loop {
            let success = self.execute(media_item, episode).await;
            match claim.release_unless_requeued(&self.registry) {
                Some(next) => {
                    debug!(media_id = media_item.id, episode = %episode, "Episode re-queued while running");
                    claim = next;
                }
                None => return success,
            }
        }
    }

    /// Run one job and record its outcome; returns whether it succeeded
    async fn execute(&self, media_item: &MediaItem, episode: &str) -> bool {
        let media_id = media_item.id;

        match self.run(media_item, episode).await {
            Ok(done) => {
                info!(
                    media_id,
                    episode = %episode,
                    path = %done.file_path.display(),
                    server = %done.server_name,
                    "Download completed"
                );
                let update = EpisodeUpdate {
                    file_path: Some(done.file_path),
                    file_size: done.file_size,
                    quality: Some(done.quality),
                    provider_name: Some(self.provider.name().to_string()),
                    server_name: Some(done.server_name),
                    subtitle_paths: Some(done.subtitle_paths),
                    ..Default::default()
                };
                match self.registry.update_episode_download_status(
                    media_id,
                    episode,
                    DownloadStatus::Completed,
                    update,
                ) {
                    Ok(_) => true,
                    Err(e) => {
                        error!(media_id, episode = %episode, error = %e, "Failed to record completed download");
                        false
                    }
                }
            }
            Err(e) => {
                error!(media_id, episode = %episode, error = %e, "Download failed");
                let update = EpisodeUpdate {
                    error_message: Some(e.to_string()),
                    ..Default::default()
                };
                if let Err(e) = self.registry.update_episode_download_status(
                    media_id,
                    episode,
                    DownloadStatus::Failed,
                    update,
                ) {
                    error!(media_id, episode = %episode, error = %e, "Failed to record download failure");
                }
                false
            }
        }
    }

    async fn run(&self, media_item: &MediaItem, episode: &str) -> Result<CompletedDownload, JobError> {
        let media_id = media_item.id;
        let marked = self.registry.update_episode_download_status(
            media_id,
            episode,
            DownloadStatus::Downloading,
            EpisodeUpdate {
                provider_name: Some(self.provider.name().to_string()),
                ..Default::default()
            },
        )?;
        if !marked {
            return Err(JobError::RecordMissing { media_id });
        }

        let title = media_item
            .title
            .preferred()
            .ok_or(JobError::NoSearchableTitle { media_id })?
            .to_string();

        let results = self
            .provider
            .search(&SearchParams {
                query: title.clone(),
                translation_type: self.translation_type,
            })
            .await
            .map_err(JobError::Provider)?;

        let no_results = || JobError::NoSearchResults {
            provider: self.provider.name().to_string(),
            title: title.clone(),
        };
        let matched = best_match(&results, &media_item.title).ok_or_else(no_results)?;
        debug!(media_id, provider_id = %matched.id, provider_title = %matched.title, "Matched provider entry");

        let anime = self
            .provider
            .get(&matched.id)
            .await
            .map_err(JobError::Provider)?;

        if !anime.episodes.contains(self.translation_type, episode) {
            return Err(JobError::EpisodeNotAvailable {
                title: anime.title,
                episode: episode.to_string(),
                translation: self.translation_type,
            });
        }

        let streams = self
            .provider
            .episode_streams(&EpisodeStreamsParams {
                anime_id: anime.id.clone(),
                query: title.clone(),
                episode: episode.to_string(),
                translation_type: self.translation_type,
                server: self.config.server.clone(),
                quality: self.config.preferred_quality.clone(),
            })
            .await
            .map_err(JobError::Provider)?;

        let server = select_server(streams, self.config.server.as_deref())
            .await
            .ok_or_else(|| JobError::NoServers {
                episode: episode.to_string(),
            })?;

        let link = server
            .best_link(&self.config.preferred_quality)
            .ok_or_else(|| JobError::NoStreamLinks {
                server: server.name.clone(),
            })?;

        let params = DownloadParams {
            url: link.link.clone(),
            anime_title: media_item.display_title(),
            episode_number: episode.to_string(),
            episode_title: server.episode_title.clone(),
            quality: link.quality.clone(),
            headers: server.headers.clone(),
            subtitles: server.subtitles.clone(),
            merge: self.config.merge_subtitles,
            clean: self.config.cleanup_after_merge,
        };

        let result = self.downloader.download(&params).await;
        let final_path = result.final_path().map(|p| p.to_path_buf());
        let file_path = match (result.success, final_path) {
            (true, Some(path)) => path,
            _ => {
                return Err(JobError::Download(
                    result
                        .error_message
                        .unwrap_or_else(|| "downloader reported no file".to_string()),
                ))
            }
        };

        let file_size = tokio::fs::metadata(&file_path).await.ok().map(|m| m.len());

        Ok(CompletedDownload {
            file_path,
            file_size,
            quality: link.quality.clone(),
            server_name: server.name.clone(),
            subtitle_paths: result.subtitle_paths,
        })
    }
}

/// First server matching `preference` (case-insensitive), else the first
/// server seen. "top" means no preference. Stops consuming the stream as
/// soon as the answer is known.
async fn select_server(mut servers: BoxStream<'static, Server>, preference: Option<&str>) -> Option<Server> {
    let preference = preference.filter(|p| !p.eq_ignore_ascii_case("top"));
    let mut first = None;

    while let Some(server) = servers.next().await {
        match preference {
            None => return Some(server),
            Some(name) if server.name.eq_ignore_ascii_case(name) => return Some(server),
            Some(_) => {
                if first.is_none() {
                    first = Some(server);
                }
            }
        }
    }

    if let (Some(name), Some(server)) = (preference, &first) {
        warn!(preferred = %name, using = %server.name, "Preferred server not offered");
    }
    first
}

/// Download orchestration service
pub struct DownloadService {
    runner: Arc<JobRunner>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
}

impl DownloadService {
    pub fn new(
        config: DownloadsConfig,
        registry: Arc<RegistryService>,
        provider: Arc<dyn ContentProvider>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        let translation_type = config.translation_type.parse().unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to sub");
            TranslationType::Sub
        });
        let workers = config.max_concurrent_downloads.max(1);

        info!(workers, translation = %translation_type, "Download service started");

        Self {
            runner: Arc::new(JobRunner {
                config,
                translation_type,
                registry,
                provider,
                downloader,
            }),
            semaphore: Arc::new(Semaphore::new(workers)),
            in_flight: Arc::new(InFlight::default()),
            handles: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
        }
    }

    fn registry(&self) -> &RegistryService {
        &self.runner.registry
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// COMPLETED with the file still on disk
    fn is_already_downloaded(&self, media_id: i64, episode: &str) -> bool {
        match self.registry().get_media_record(media_id) {
            Ok(Some(record)) => record.episode(episode).is_some_and(|e| {
                e.download_status == DownloadStatus::Completed
                    && e.file_path.as_ref().is_some_and(|p| p.exists())
            }),
            _ => false,
        }
    }

    /// Queue one episode for background download.
    ///
    /// Returns `false` only when the request could not be recorded.
    pub async fn add_to_queue(&self, media_item: &MediaItem, episode: &str) -> bool {
        self.submit(media_item, episode).accepted()
    }

    fn submit(&self, media_item: &MediaItem, episode: &str) -> Submission {
        let media_id = media_item.id;

        if !self.accepting.load(Ordering::SeqCst) {
            warn!(media_id, episode = %episode, "Download service is shut down, not queueing");
            return Submission::Rejected;
        }

        if let Err(e) = self.registry().get_or_create_record(media_item) {
            error!(media_id, error = %e, "Failed to create media record");
            return Submission::Rejected;
        }

        if self.is_already_downloaded(media_id, episode) {
            info!(media_id, episode = %episode, "Episode already downloaded, skipping");
            return Submission::AlreadyDownloaded;
        }

        match self.registry().update_episode_download_status(
            media_id,
            episode,
            DownloadStatus::Queued,
            EpisodeUpdate::default(),
        ) {
            Ok(true) => {}
            Ok(false) => return Submission::Rejected,
            Err(e) => {
                error!(media_id, episode = %episode, error = %e, "Failed to queue episode");
                return Submission::Rejected;
            }
        }

        let Some(claim) = self.in_flight.claim((media_id, episode.to_string())) else {
            debug!(media_id, episode = %episode, "Episode already in flight");
            return Submission::AlreadyInFlight;
        };

        let runner = Arc::clone(&self.runner);
        let semaphore = Arc::clone(&self.semaphore);
        let media_item = media_item.clone();
        let job_episode = episode.to_string();

        let handle = tokio::spawn(async move {
            // Closed on shutdown without waiting; the episode stays QUEUED
            let Ok(_permit) = semaphore.acquire_owned().await else {
                debug!(media_id = media_item.id, episode = %job_episode, "Pool closed before job started");
                return;
            };
            runner.run_claimed(claim, &media_item, &job_episode).await;
        });

        let mut handles = self.handles();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);

        info!(media_id, episode = %episode, "Queued episode");
        Submission::Spawned
    }

    /// Download episodes one after another on the calling task.
    ///
    /// Returns episode -> success. Episodes already in flight elsewhere in
    /// this process count as failures here.
    pub async fn download_episodes_sync(
        &self,
        media_item: &MediaItem,
        episodes: &[String],
    ) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        let media_id = media_item.id;

        if let Err(e) = self.registry().get_or_create_record(media_item) {
            error!(media_id, error = %e, "Failed to create media record");
            return episodes.iter().map(|ep| (ep.clone(), false)).collect();
        }

        for episode in episodes {
            if self.is_already_downloaded(media_id, episode) {
                info!(media_id, episode = %episode, "Episode already downloaded, skipping");
                results.insert(episode.clone(), true);
                continue;
            }

            let Some(claim) = self.in_flight.claim((media_id, episode.clone())) else {
                warn!(media_id, episode = %episode, "Episode is already being downloaded");
                results.insert(episode.clone(), false);
                continue;
            };

            let success = self.runner.run_claimed(claim, media_item, episode).await;
            results.insert(episode.clone(), success);
        }

        results
    }

    /// Resubmit every QUEUED or DOWNLOADING episode not running here.
    ///
    /// Returns the number of jobs started.
    pub async fn resume_unfinished_downloads(&self) -> usize {
        let mut pending = Vec::new();
        for status in DownloadStatus::ALL.into_iter().filter(DownloadStatus::is_unfinished) {
            match self.registry().get_episodes_by_download_status(status) {
                Ok(episodes) => pending.extend(episodes),
                Err(e) => {
                    error!(status = %status, error = %e, "Failed to list unfinished downloads");
                    return 0;
                }
            }
        }

        let resumed = self.resubmit(pending, "resume");
        if resumed > 0 {
            info!(count = resumed, "Resumed unfinished downloads");
        }
        resumed
    }

    /// Re-queue FAILED episodes that still have attempts left
    pub async fn retry_failed_downloads(&self) -> usize {
        let max_attempts = self.runner.config.max_retry_attempts;
        let failed = match self
            .registry()
            .get_episodes_by_download_status(DownloadStatus::Failed)
        {
            Ok(failed) => failed,
            Err(e) => {
                error!(error = %e, "Failed to list failed downloads");
                return 0;
            }
        };

        let retryable: Vec<_> = failed
            .into_iter()
            .filter(|(media_id, episode)| {
                match self.registry().get_media_record(*media_id) {
                    Ok(Some(record)) => record
                        .episode(episode)
                        .is_some_and(|e| e.download_attempts < max_attempts),
                    _ => false,
                }
            })
            .collect();

        let retried = self.resubmit(retryable, "retry");
        if retried > 0 {
            info!(count = retried, "Retrying failed downloads");
        }
        retried
    }

    fn resubmit(&self, episodes: Vec<JobKey>, reason: &str) -> usize {
        let mut started = 0;
        let mut seen = HashSet::new();

        for key in episodes {
            if !seen.insert(key.clone()) || self.in_flight.contains(&key) {
                continue;
            }
            let (media_id, episode) = key;

            let record = match self.registry().get_media_record(media_id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    error!(
                        media_id,
                        episode = %episode,
                        "Cannot {} download: media metadata missing, re-sync this title",
                        reason
                    );
                    continue;
                }
                Err(e) => {
                    error!(media_id, episode = %episode, error = %e, "Failed to read media record");
                    continue;
                }
            };

            if self.submit(&record.media_item, &episode) == Submission::Spawned {
                started += 1;
            }
        }

        started
    }

    pub fn get_download_status(&self, media_id: i64, episode: &str) -> Option<DownloadStatus> {
        match self.registry().get_media_record(media_id) {
            Ok(record) => record
                .and_then(|r| r.episode(episode).map(|e| e.download_status)),
            Err(e) => {
                error!(media_id, error = %e, "Failed to read media record");
                None
            }
        }
    }

    /// Completed episodes whose files still exist
    pub fn get_downloaded_episodes(&self, media_id: i64) -> Vec<String> {
        match self.registry().get_media_record(media_id) {
            Ok(Some(record)) => record
                .media_episodes
                .into_iter()
                .filter(|e| {
                    e.download_status == DownloadStatus::Completed
                        && e.file_path.as_ref().is_some_and(|p| p.exists())
                })
                .map(|e| e.episode_number)
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                error!(media_id, error = %e, "Failed to read media record");
                Vec::new()
            }
        }
    }

    /// Delete an episode's files and forget it
    pub fn remove_downloaded_episode(&self, media_id: i64, episode: &str) -> bool {
        let record = match self.registry().get_media_record(media_id) {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                error!(media_id, error = %e, "Failed to read media record");
                return false;
            }
        };
        let Some(entry) = record.episode(episode) else {
            return false;
        };

        for path in entry.file_path.iter().chain(entry.subtitle_paths.iter()) {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to remove file");
                    return false;
                }
            }
        }

        match self.registry().remove_episode(media_id, episode) {
            Ok(removed) => {
                info!(media_id, episode = %episode, "Removed downloaded episode");
                removed
            }
            Err(e) => {
                error!(media_id, episode = %episode, error = %e, "Failed to remove episode");
                false
            }
        }
    }

    /// Mark an episode PAUSED so it is not resumed automatically
    pub fn pause_download(&self, media_id: i64, episode: &str) -> bool {
        match self.registry().update_episode_download_status(
            media_id,
            episode,
            DownloadStatus::Paused,
            EpisodeUpdate::default(),
        ) {
            Ok(updated) => updated,
            Err(e) => {
                error!(media_id, episode = %episode, error = %e, "Failed to pause download");
                false
            }
        }
    }

    pub fn get_download_statistics(&self) -> RegistryResult<DownloadStatistics> {
        self.registry().get_download_statistics()
    }

    /// Number of episodes owned by a job right now
    pub fn active_jobs(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Wait for every job submitted so far
    pub async fn wait_for_jobs(&self) {
        loop {
            let handles = std::mem::take(&mut *self.handles());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Download job panicked");
                }
            }
        }
    }

    /// Stop accepting submissions.
    ///
    /// With `wait`, queued and running jobs are awaited. Without it, jobs
    /// not yet started are dropped (they stay QUEUED in the registry) and
    /// running ones are detached.
    pub async fn shutdown(&self, wait: bool) {
        self.accepting.store(false, Ordering::SeqCst);

        if wait {
            self.wait_for_jobs().await;
        } else {
            self.semaphore.close();
            self.handles().clear();
        }

        info!(wait, "Download service shut down");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::downloader::DownloadResult;
    use crate::provider::{AnimeEpisodes, ProviderAnime, ProviderSearchResult};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use futures::stream;
    use shared::RegistryConfig;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Provider offering episodes 1..=12 on servers "alpha" and "beta".
    ///
    /// Searches are numbered from 0; those listed in `empty_searches` find
    /// nothing.
    pub(crate) struct FakeProvider {
        pub fail_search: AtomicBool,
        pub empty_search: AtomicBool,
        pub empty_searches: Mutex<HashSet<usize>>,
        pub searches: AtomicUsize,
    }

    impl FakeProvider {
        pub(crate) fn new() -> Self {
            Self {
                fail_search: AtomicBool::new(false),
                empty_search: AtomicBool::new(false),
                empty_searches: Mutex::new(HashSet::new()),
                searches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ContentProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn search(&self, params: &SearchParams) -> Result<Vec<ProviderSearchResult>> {
            let call = self.searches.fetch_add(1, Ordering::SeqCst);
            if self.fail_search.load(Ordering::SeqCst) {
                return Err(anyhow!("provider unreachable"));
            }
            if self.empty_search.load(Ordering::SeqCst)
                || self.empty_searches.lock().unwrap().contains(&call)
            {
                return Ok(Vec::new());
            }
            Ok(vec![ProviderSearchResult {
                id: format!("p-{}", params.query),
                title: params.query.clone(),
                episodes: AnimeEpisodes::default(),
                other_titles: Vec::new(),
                year: None,
            }])
        }

        async fn get(&self, provider_id: &str) -> Result<ProviderAnime> {
            Ok(ProviderAnime {
                id: provider_id.to_string(),
                title: provider_id.trim_start_matches("p-").to_string(),
                episodes: AnimeEpisodes {
                    sub: (1..=12).map(|n| n.to_string()).collect(),
                    dub: Vec::new(),
                },
                poster: None,
                year: None,
            })
        }

        async fn episode_streams(
            &self,
            params: &EpisodeStreamsParams,
        ) -> Result<BoxStream<'static, Server>> {
            let servers = ["alpha", "beta"]
                .into_iter()
                .map(|name| Server {
                    name: name.to_string(),
                    links: vec![crate::provider::EpisodeStream {
                        link: format!("https://{}/{}/{}.mp4", name, params.anime_id, params.episode),
                        title: None,
                        quality: "1080".to_string(),
                        format: None,
                    }],
                    episode_title: None,
                    headers: HashMap::new(),
                    subtitles: Vec::new(),
                })
                .collect::<Vec<_>>();
            Ok(stream::iter(servers).boxed())
        }
    }

    /// Writes a small file per request; links containing "/bad/" or listed
    /// in `fail_episodes` fail
    pub(crate) struct FakeDownloader {
        root: PathBuf,
        pub calls: Mutex<Vec<DownloadParams>>,
        pub fail_episodes: Mutex<HashSet<String>>,
        pub active: AtomicUsize,
        pub max_active: AtomicUsize,
        pub delay: Duration,
    }

    impl FakeDownloader {
        pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
            Self {
                root: root.into(),
                calls: Mutex::new(Vec::new()),
                fail_episodes: Mutex::new(HashSet::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                delay: Duration::from_millis(20),
            }
        }

        pub(crate) fn calls_for(&self, episode: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.episode_number == episode)
                .count()
        }
    }

    #[async_trait]
    impl Downloader for FakeDownloader {
        async fn download(&self, params: &DownloadParams) -> DownloadResult {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            self.calls.lock().unwrap().push(params.clone());

            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail_episodes.lock().unwrap().contains(&params.episode_number) {
                return DownloadResult::failed("connection reset");
            }

            let dir = self.root.join(&params.anime_title);
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join(format!("{}.mp4", params.episode_number));
            std::fs::write(&path, params.url.as_bytes()).unwrap();

            DownloadResult {
                success: true,
                video_path: Some(path),
                ..Default::default()
            }
        }
    }

    pub(crate) struct Fixture {
        pub _temp: TempDir,
        pub registry: Arc<RegistryService>,
        pub provider: Arc<FakeProvider>,
        pub downloader: Arc<FakeDownloader>,
        pub config: DownloadsConfig,
    }

    impl Fixture {
        pub(crate) fn new() -> Result<Self> {
            let temp = TempDir::new()?;
            let registry_config = RegistryConfig {
                media_dir: temp.path().join("registry/media"),
                index_dir: temp.path().join("registry"),
                ..Default::default()
            };
            let config = DownloadsConfig {
                downloads_dir: temp.path().join("downloads"),
                max_concurrent_downloads: 2,
                ..Default::default()
            };

            Ok(Self {
                registry: Arc::new(RegistryService::new("jikan", &registry_config)),
                provider: Arc::new(FakeProvider::new()),
                downloader: Arc::new(FakeDownloader::new(temp.path().join("downloads"))),
                config,
                _temp: temp,
            })
        }

        pub(crate) fn service(&self) -> DownloadService {
            DownloadService::new(
                self.config.clone(),
                Arc::clone(&self.registry),
                self.provider.clone(),
                self.downloader.clone(),
            )
        }
    }

    fn episodes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_sync_download_records_completion() -> Result<()> {
        let fx = Fixture::new()?;
        let service = fx.service();
        let item = MediaItem::new(1, "Frieren");

        let results = service
            .download_episodes_sync(&item, &episodes(&["1", "2"]))
            .await;
        assert_eq!(results, BTreeMap::from([("1".into(), true), ("2".into(), true)]));

        let record = fx.registry.get_media_record(1)?.unwrap();
        let ep = record.episode("1").unwrap();
        assert_eq!(ep.download_status, DownloadStatus::Completed);
        assert_eq!(ep.provider_name.as_deref(), Some("fake"));
        assert_eq!(ep.server_name.as_deref(), Some("alpha"));
        assert_eq!(ep.quality.as_deref(), Some("1080"));
        assert!(ep.file_size.is_some());
        assert!(ep.download_date.is_some());
        assert_eq!(service.get_downloaded_episodes(1), vec!["1", "2"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_isolated() -> Result<()> {
        let fx = Fixture::new()?;
        fx.downloader.fail_episodes.lock().unwrap().insert("2".into());
        let service = fx.service();
        let item = MediaItem::new(7, "Mushishi");

        for ep in ["1", "2", "3"] {
            assert!(service.add_to_queue(&item, ep).await);
        }
        service.shutdown(true).await;

        assert_eq!(service.get_download_status(7, "1"), Some(DownloadStatus::Completed));
        assert_eq!(service.get_download_status(7, "3"), Some(DownloadStatus::Completed));
        assert_eq!(service.get_download_status(7, "2"), Some(DownloadStatus::Failed));

        let record = fx.registry.get_media_record(7)?.unwrap();
        let failed = record.episode("2").unwrap();
        assert_eq!(failed.download_attempts, 1);
        assert!(failed.last_error.as_deref().unwrap().contains("connection reset"));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_search_fails_only_that_episode() -> Result<()> {
        let fx = Fixture::new()?;
        // Episodes run in order, so the third search belongs to episode "3"
        fx.provider.empty_searches.lock().unwrap().insert(2);
        let service = fx.service();
        let item = MediaItem::new(12, "Kaiba");

        let results = service
            .download_episodes_sync(&item, &episodes(&["1", "2", "3", "4"]))
            .await;
        assert_eq!(
            results,
            BTreeMap::from([
                ("1".into(), true),
                ("2".into(), true),
                ("3".into(), false),
                ("4".into(), true),
            ])
        );

        let record = fx.registry.get_media_record(12)?.unwrap();
        for ep in ["1", "2", "4"] {
            assert_eq!(
                record.episode(ep).unwrap().download_status,
                DownloadStatus::Completed,
                "episode {}",
                ep
            );
        }
        let failed = record.episode("3").unwrap();
        assert_eq!(failed.download_status, DownloadStatus::Failed);
        assert_eq!(failed.download_attempts, 1);
        assert!(failed.last_error.as_deref().unwrap().contains("no results"));
        assert_eq!(fx.downloader.calls_for("3"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_job_without_record_does_not_download() -> Result<()> {
        let fx = Fixture::new()?;
        let service = fx.service();

        let success = service
            .runner
            .execute(&MediaItem::new(13, "Kemonozume"), "1")
            .await;

        assert!(!success);
        assert_eq!(fx.downloader.calls_for("1"), 0);
        assert!(fx.registry.get_media_record(13)?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_requeue_while_in_flight_is_picked_up() -> Result<()> {
        let fx = Fixture::new()?;
        let service = fx.service();
        let item = MediaItem::new(14, "Texhnolyze");
        let key = (14, "2".to_string());

        // Stand in for a job that has recorded its outcome but not yet
        // released the episode
        let claim = service.in_flight.claim(key.clone()).unwrap();
        assert!(service.add_to_queue(&item, "2").await);
        assert_eq!(service.get_download_status(14, "2"), Some(DownloadStatus::Queued));

        let claim = claim.release_unless_requeued(&fx.registry).unwrap();
        assert!(service.in_flight.contains(&key));

        let success = service.runner.run_claimed(claim, &item, "2").await;
        assert!(success);
        assert!(!service.in_flight.contains(&key));
        assert_eq!(service.get_download_status(14, "2"), Some(DownloadStatus::Completed));
        assert_eq!(fx.downloader.calls_for("2"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_pool_is_bounded() -> Result<()> {
        let fx = Fixture::new()?;
        let service = fx.service();
        let item = MediaItem::new(3, "Monster");

        for ep in 1..=6 {
            service.add_to_queue(&item, &ep.to_string()).await;
        }
        service.shutdown(true).await;

        assert_eq!(fx.downloader.calls.lock().unwrap().len(), 6);
        assert!(fx.downloader.max_active.load(Ordering::SeqCst) <= 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_then_retried() -> Result<()> {
        let fx = Fixture::new()?;
        fx.provider.empty_search.store(true, Ordering::SeqCst);
        let service = fx.service();
        let item = MediaItem::new(9, "Dororo");

        let results = service.download_episodes_sync(&item, &episodes(&["5"])).await;
        assert_eq!(results.get("5"), Some(&false));
        let record = fx.registry.get_media_record(9)?.unwrap();
        let failed = record.episode("5").unwrap();
        assert_eq!(failed.download_status, DownloadStatus::Failed);
        assert_eq!(failed.download_attempts, 1);
        assert!(failed
            .last_error
            .as_deref()
            .unwrap()
            .contains("no results for 'Dororo'"));

        fx.provider.empty_search.store(false, Ordering::SeqCst);
        assert_eq!(service.retry_failed_downloads().await, 1);
        service.shutdown(true).await;

        let record = fx.registry.get_media_record(9)?.unwrap();
        let ep = record.episode("5").unwrap();
        assert_eq!(ep.download_status, DownloadStatus::Completed);
        assert_eq!(ep.download_attempts, 1);
        assert_eq!(record.media_episodes.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_respects_attempt_limit() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.config.max_retry_attempts = 1;
        fx.provider.fail_search.store(true, Ordering::SeqCst);
        let service = fx.service();

        service
            .download_episodes_sync(&MediaItem::new(2, "Ping Pong"), &episodes(&["1"]))
            .await;
        assert_eq!(service.retry_failed_downloads().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_submits_each_episode_once() -> Result<()> {
        let fx = Fixture::new()?;
        for (id, title) in [(1, "Frieren"), (2, "Mushishi")] {
            fx.registry.get_or_create_record(&MediaItem::new(id, title))?;
        }
        let seeded = [
            (1, "1", DownloadStatus::Queued),
            (1, "2", DownloadStatus::Downloading),
            (2, "5", DownloadStatus::Queued),
            (2, "6", DownloadStatus::Completed),
            (2, "7", DownloadStatus::Paused),
        ];
        for (id, ep, status) in seeded {
            fx.registry
                .update_episode_download_status(id, ep, status, EpisodeUpdate::default())?;
        }

        let service = fx.service();
        assert_eq!(service.resume_unfinished_downloads().await, 3);
        // Everything is now in flight, nothing new to submit
        assert_eq!(service.resume_unfinished_downloads().await, 0);
        service.shutdown(true).await;

        for ep in ["1", "2", "5"] {
            assert_eq!(fx.downloader.calls_for(ep), 1, "episode {}", ep);
        }
        assert_eq!(fx.downloader.calls_for("6"), 0);
        assert_eq!(fx.downloader.calls_for("7"), 0);
        assert_eq!(service.get_download_status(2, "7"), Some(DownloadStatus::Paused));
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_queueing_keeps_one_record() -> Result<()> {
        let fx = Fixture::new()?;
        let service = fx.service();
        let item = MediaItem::new(4, "Haikyuu");

        assert!(service.add_to_queue(&item, "3").await);
        assert!(service.add_to_queue(&item, "3").await);
        service.shutdown(true).await;

        let record = fx.registry.get_media_record(4)?.unwrap();
        assert_eq!(record.media_episodes.len(), 1);
        assert_eq!(fx.downloader.calls_for("3"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_completed_episode_is_skipped() -> Result<()> {
        let fx = Fixture::new()?;
        let service = fx.service();
        let item = MediaItem::new(5, "Cowboy Bebop");

        service.download_episodes_sync(&item, &episodes(&["1"])).await;
        let results = service.download_episodes_sync(&item, &episodes(&["1"])).await;

        assert_eq!(results.get("1"), Some(&true));
        assert_eq!(fx.downloader.calls_for("1"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_server_preference() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.config.server = Some("BETA".to_string());
        let service = fx.service();

        service
            .download_episodes_sync(&MediaItem::new(6, "Trigun"), &episodes(&["2"]))
            .await;

        let calls = fx.downloader.calls.lock().unwrap().clone();
        assert!(calls[0].url.starts_with("https://beta/"));
        Ok(())
    }

    #[tokio::test]
    async fn test_select_server_falls_back_to_first() {
        let servers = |names: &[&str]| -> BoxStream<'static, Server> {
            let list: Vec<Server> = names
                .iter()
                .map(|n| Server {
                    name: n.to_string(),
                    links: Vec::new(),
                    episode_title: None,
                    headers: HashMap::new(),
                    subtitles: Vec::new(),
                })
                .collect();
            stream::iter(list).boxed()
        };

        let chosen = select_server(servers(&["a", "b"]), Some("missing")).await;
        assert_eq!(chosen.unwrap().name, "a");
        let chosen = select_server(servers(&["a", "b"]), Some("TOP")).await;
        assert_eq!(chosen.unwrap().name, "a");
        assert!(select_server(servers(&[]), None).await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_episode_fails() -> Result<()> {
        let fx = Fixture::new()?;
        let service = fx.service();

        let results = service
            .download_episodes_sync(&MediaItem::new(8, "Berserk"), &episodes(&["99"]))
            .await;
        assert_eq!(results.get("99"), Some(&false));

        let record = fx.registry.get_media_record(8)?.unwrap();
        let error = record.episode("99").unwrap().last_error.clone().unwrap();
        assert!(error.contains("not available"), "{}", error);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_and_pause() -> Result<()> {
        let fx = Fixture::new()?;
        let service = fx.service();
        let item = MediaItem::new(10, "Planetes");

        service.download_episodes_sync(&item, &episodes(&["1"])).await;
        let path = fx.registry.get_media_record(10)?.unwrap().episode("1").unwrap().file_path.clone().unwrap();
        assert!(path.exists());

        assert!(service.remove_downloaded_episode(10, "1"));
        assert!(!path.exists());
        assert!(service.get_download_status(10, "1").is_none());
        assert!(!service.remove_downloaded_episode(10, "1"));

        assert!(service.pause_download(10, "2"));
        assert_eq!(service.get_download_status(10, "2"), Some(DownloadStatus::Paused));
        assert!(!service.pause_download(404, "1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() -> Result<()> {
        let fx = Fixture::new()?;
        let service = fx.service();
        service.shutdown(false).await;

        assert!(!service.add_to_queue(&MediaItem::new(11, "Akira"), "1").await);
        assert!(fx.registry.get_media_record(11)?.is_none());

        let stats = service.get_download_statistics()?;
        assert_eq!(stats.total_episodes, 0);
        Ok(())
    }
}
