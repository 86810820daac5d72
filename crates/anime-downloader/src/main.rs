//! Anime episode downloader.
//!
//! Resolves titles through the metadata API, downloads episodes through
//! the configured provider and keeps the local registry up to date.

use anime_downloader::api::{JikanClient, MetadataApi};
use anime_downloader::{BackgroundWorkerService, CommandProvider, DownloadService, HttpDownloader};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use shared::{
    Config, DownloadStatus, LogConfig, MediaItem, MediaSearchParams, MediaSort, RegistryService,
    UserMediaListStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Target {
    /// Search the metadata API for this title
    #[arg(long, conflicts_with = "media_id", required_unless_present = "media_id")]
    title: Option<String>,

    /// Metadata API id
    #[arg(long)]
    media_id: Option<i64>,

    /// Episodes, e.g. "5", "1-10", "8:12" or "1,3,5-7"
    #[arg(short, long)]
    episodes: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue episodes and wait for them to finish
    Queue(Target),
    /// Download episodes one by one in the foreground
    Download(Target),
    /// Resubmit downloads interrupted by a previous run
    Resume,
    /// Re-queue failed downloads that have attempts left
    Retry,
    /// Mark an episode as paused
    Pause { media_id: i64, episode: String },
    /// Show registry and download statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// List media in the registry
    List {
        /// User list status, e.g. watching
        #[arg(long)]
        status: Option<String>,
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 15)]
        per_page: usize,
        /// Sort keys such as SCORE_DESC; the first is primary
        #[arg(long)]
        sort: Vec<String>,
    },
    /// Remove a media record, or one downloaded episode of it
    Remove {
        media_id: i64,
        #[arg(long)]
        episode: Option<String>,
    },
    /// Run the background worker until interrupted
    Worker,
}

/// Expand "1-3,5,8:9" into ["1", "2", "3", "5", "8", "9"].
///
/// Non-numeric single episodes ("12.5") are kept as given.
fn parse_episode_range(ranges: &str) -> Result<Vec<String>> {
    let mut episodes: Vec<String> = Vec::new();

    for part in ranges.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once(['-', ':']) {
            Some((start, end)) => {
                let start: u32 = start
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid range start in '{}'", part))?;
                let end: u32 = end
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid range end in '{}'", part))?;
                if start > end {
                    bail!("Range '{}' is reversed", part);
                }
                for ep in start..=end {
                    let ep = ep.to_string();
                    if !episodes.contains(&ep) {
                        episodes.push(ep);
                    }
                }
            }
            None => {
                if !episodes.iter().any(|e| e == part) {
                    episodes.push(part.to_string());
                }
            }
        }
    }

    if episodes.is_empty() {
        bail!("No episodes in '{}'", ranges);
    }
    Ok(episodes)
}

async fn resolve_media(
    target: &Target,
    registry: &RegistryService,
    api: &dyn MetadataApi,
) -> Result<MediaItem> {
    if let Some(id) = target.media_id {
        if let Some(record) = registry.get_media_record(id)? {
            return Ok(record.media_item);
        }
        return api
            .get_media(id)
            .await?
            .with_context(|| format!("No media with id {} on {}", id, api.api_name()));
    }

    let title = target.title.as_deref().unwrap_or_default();
    let mut results = api.search(title, 5).await?;
    if results.is_empty() {
        bail!("No results for '{}' on {}", title, api.api_name());
    }
    let item = results.remove(0);
    info!(media_id = item.id, title = %item.display_title(), "Resolved title");
    Ok(item)
}

fn print_statuses(service: &DownloadService, media: &MediaItem, episodes: &[String]) {
    println!("{}", media.display_title());
    for episode in episodes {
        let status = service
            .get_download_status(media.id, episode)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!("  episode {:>4}  {}", episode, status);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let mut log_config = LogConfig::from_config(&config, "anime_downloader");
    if cli.verbose {
        log_config.default_level = tracing::Level::DEBUG;
    }
    shared::logging::init(log_config)?;

    info!(config_file = %cli.config.display(), "Loaded configuration");

    let registry = Arc::new(RegistryService::new(
        config.registry.media_api.clone(),
        &config.registry_config(),
    ));
    // Refuse to touch a registry written by an incompatible version
    registry
        .load_index()
        .context("Registry cannot be opened")?;

    let api = JikanClient::new(&config.metadata_api)?;
    if api.api_name() != registry.media_api() {
        warn!(
            api = api.api_name(),
            registry = registry.media_api(),
            "Metadata API does not match the registry partition"
        );
    }

    let downloads = config.downloads_config();
    let service = Arc::new(DownloadService::new(
        downloads.clone(),
        Arc::clone(&registry),
        Arc::new(CommandProvider::new(&config.provider)),
        Arc::new(HttpDownloader::new(&downloads.downloads_dir)?),
    ));

    match cli.command {
        Command::Queue(target) => {
            let episodes = parse_episode_range(&target.episodes)?;
            let media = resolve_media(&target, &registry, &api).await?;

            for episode in &episodes {
                if !service.add_to_queue(&media, episode).await {
                    warn!(episode = %episode, "Episode was not queued");
                }
            }
            service.shutdown(true).await;
            print_statuses(&service, &media, &episodes);
        }
        Command::Download(target) => {
            let episodes = parse_episode_range(&target.episodes)?;
            let media = resolve_media(&target, &registry, &api).await?;

            let results = service.download_episodes_sync(&media, &episodes).await;
            let failed = results.values().filter(|ok| !**ok).count();
            print_statuses(&service, &media, &episodes);
            if failed > 0 {
                bail!("{} of {} episodes failed", failed, results.len());
            }
        }
        Command::Resume => {
            let resumed = service.resume_unfinished_downloads().await;
            println!("Resumed {} downloads", resumed);
            service.shutdown(true).await;
        }
        Command::Retry => {
            let retried = service.retry_failed_downloads().await;
            println!("Retrying {} downloads", retried);
            service.shutdown(true).await;
        }
        Command::Pause { media_id, episode } => {
            if !service.pause_download(media_id, &episode) {
                bail!("No media record for id {}", media_id);
            }
            println!("Paused episode {} of {}", episode, media_id);
        }
        Command::Stats { json } => {
            let stats = registry.get_registry_stats()?;
            let downloads = service.get_download_statistics()?;

            if json {
                let report = serde_json::json!({ "registry": stats, "downloads": downloads });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Media:        {}", stats.total_media);
                for (status, count) in &stats.status_breakdown {
                    println!("  {:<12}{}", status, count);
                }
                println!("Episodes:     {}", downloads.total_episodes);
                println!("  downloaded  {}", downloads.downloaded);
                println!("  queued      {}", downloads.queued);
                println!("  downloading {}", downloads.downloading);
                println!("  failed      {}", downloads.failed);
                println!("  paused      {}", downloads.paused);
                println!(
                    "Disk usage:   {:.1} MiB",
                    downloads.total_size_bytes as f64 / (1024.0 * 1024.0)
                );
            }
        }
        Command::List {
            status,
            query,
            page,
            per_page,
            sort,
        } => {
            let mut params = MediaSearchParams {
                query,
                page,
                per_page,
                sort: sort
                    .iter()
                    .map(|s| s.parse::<MediaSort>())
                    .collect::<Result<_>>()?,
                ..Default::default()
            };

            if let Some(status) = status {
                let status: UserMediaListStatus = status.parse()?;
                params.id_in = registry
                    .get_media_by_status(status)?
                    .into_iter()
                    .map(|m| m.id)
                    .collect();
                if params.id_in.is_empty() {
                    println!("No media with status {}", status);
                    return Ok(());
                }
            }

            let result = registry.search_for_media(&params)?;
            for media in &result.media {
                println!(
                    "{:>8}  {:<50}  {}/{}",
                    media.id,
                    media.display_title(),
                    service.get_downloaded_episodes(media.id).len(),
                    media
                        .episodes
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                );
            }
            println!(
                "Page {} ({} total{})",
                result.page_info.current_page,
                result.page_info.total,
                if result.page_info.has_next_page { ", more available" } else { "" }
            );
        }
        Command::Remove { media_id, episode } => match episode {
            Some(episode) => {
                if !service.remove_downloaded_episode(media_id, &episode) {
                    bail!("Episode {} of {} could not be removed", episode, media_id);
                }
                println!("Removed episode {} of {}", episode, media_id);
            }
            None => {
                let unfinished = registry
                    .get_media_record(media_id)?
                    .map(|r| {
                        r.media_episodes
                            .iter()
                            .filter(|e| e.download_status == DownloadStatus::Downloading)
                            .count()
                    })
                    .unwrap_or(0);
                if unfinished > 0 {
                    warn!(media_id, unfinished, "Removing media with downloads in progress");
                }
                registry.remove_media_record(media_id)?;
                println!("Removed media {}", media_id);
            }
        },
        Command::Worker => {
            let worker = BackgroundWorkerService::new(config.worker.clone(), service, None);
            worker.run().await?;
        }
    }

    Ok(())
}
