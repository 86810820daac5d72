//! Episode file transfer.
//!
//! The [`Downloader`] trait takes a resolved stream link and produces files
//! on disk. [`HttpDownloader`] streams the video body to a `.part` file,
//! renames it into place, fetches subtitles next to it and can mux them
//! into a Matroska container with ffmpeg.

use crate::provider::Subtitle;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use shared::DownloadPaths;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "m4v", "ts"];
const SUBTITLE_EXTENSIONS: &[&str] = &["vtt", "srt", "ass", "ssa"];

/// Everything needed to fetch one episode
#[derive(Debug, Clone)]
pub struct DownloadParams {
    pub url: String,
    pub anime_title: String,
    pub episode_number: String,
    pub episode_title: Option<String>,
    pub quality: String,
    pub headers: HashMap<String, String>,
    pub subtitles: Vec<Subtitle>,
    /// Mux subtitles into the video container
    pub merge: bool,
    /// Delete the separate files after a successful merge
    pub clean: bool,
}

/// Outcome of a transfer
#[derive(Debug, Clone, Default)]
pub struct DownloadResult {
    pub success: bool,
    pub video_path: Option<PathBuf>,
    pub subtitle_paths: Vec<PathBuf>,
    pub merged_path: Option<PathBuf>,
    pub error_message: Option<String>,
}

impl DownloadResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// The file that represents the episode: the merged file if any
    pub fn final_path(&self) -> Option<&Path> {
        self.merged_path.as_deref().or(self.video_path.as_deref())
    }
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Transfer failures are reported through the result, not as panics or errors
    async fn download(&self, params: &DownloadParams) -> DownloadResult;
}

/// Plain HTTP(S) downloader
pub struct HttpDownloader {
    client: Client,
    paths: DownloadPaths,
}

impl HttpDownloader {
    pub fn new(downloads_dir: impl AsRef<Path>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("anime-downloader/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            paths: DownloadPaths::new(downloads_dir),
        })
    }

    async fn try_download(&self, params: &DownloadParams) -> Result<DownloadResult> {
        let extension = url_extension(&params.url);
        if extension.as_deref() == Some("m3u8") {
            bail!("HLS playlists are not supported: {}", params.url);
        }
        let extension = extension
            .filter(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
            .unwrap_or_else(|| "mp4".to_string());

        let headers = header_map(&params.headers);
        let video_path =
            self.paths
                .episode_file(&params.anime_title, &params.episode_number, &extension);

        info!(
            title = %params.anime_title,
            episode = %params.episode_number,
            quality = %params.quality,
            path = %video_path.display(),
            "Downloading episode"
        );
        self.fetch_to_file(&params.url, &headers, &video_path).await?;

        let mut subtitle_paths = Vec::new();
        for (i, subtitle) in params.subtitles.iter().enumerate() {
            let language = subtitle
                .language
                .clone()
                .unwrap_or_else(|| format!("sub{}", i + 1));
            let extension = url_extension(&subtitle.url)
                .filter(|e| SUBTITLE_EXTENSIONS.contains(&e.as_str()))
                .unwrap_or_else(|| "vtt".to_string());
            let path = self.paths.subtitle_file(
                &params.anime_title,
                &params.episode_number,
                &language,
                &extension,
            );

            // A missing subtitle doesn't fail the episode
            match self.fetch_to_file(&subtitle.url, &headers, &path).await {
                Ok(()) => subtitle_paths.push(path),
                Err(e) => warn!(url = %subtitle.url, error = %e, "Failed to download subtitle"),
            }
        }

        let mut merged_path = None;
        if params.merge && !subtitle_paths.is_empty() {
            let output = video_path.with_extension("merged.mkv");
            merge_subtitles(&video_path, &subtitle_paths, &output).await?;

            if params.clean {
                for path in std::iter::once(&video_path).chain(subtitle_paths.iter()) {
                    if let Err(e) = fs::remove_file(path).await {
                        warn!(path = %path.display(), error = %e, "Failed to remove merged source");
                    }
                }
                let target = video_path.with_extension("mkv");
                fs::rename(&output, &target)
                    .await
                    .with_context(|| format!("Failed to rename {}", output.display()))?;
                merged_path = Some(target);
                subtitle_paths.clear();
            } else {
                merged_path = Some(output);
            }
        }

        Ok(DownloadResult {
            success: true,
            video_path: Some(video_path),
            subtitle_paths,
            merged_path,
            error_message: None,
        })
    }

    async fn fetch_to_file(&self, url: &str, headers: &HeaderMap, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let mut response = self
            .client
            .get(url)
            .headers(headers.clone())
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Bad response from {}", url))?;

        let part = path.with_extension(format!(
            "{}.part",
            path.extension().and_then(|e| e.to_str()).unwrap_or("bin")
        ));
        let written = match write_body(&mut response, url, &part).await {
            Ok(written) => written,
            Err(e) => {
                match fs::remove_file(&part).await {
                    Ok(()) => debug!(path = %part.display(), "Removed partial file"),
                    Err(rm) if rm.kind() == std::io::ErrorKind::NotFound => {}
                    Err(rm) => warn!(path = %part.display(), error = %rm, "Failed to remove partial file"),
                }
                return Err(e);
            }
        };

        fs::rename(&part, path)
            .await
            .with_context(|| format!("Failed to move {} into place", part.display()))?;

        debug!(url = %url, path = %path.display(), bytes = written, "Transfer finished");
        Ok(())
    }
}

/// Stream the response body into `part`; returns the byte count
async fn write_body(response: &mut reqwest::Response, url: &str, part: &Path) -> Result<u64> {
    let mut file = fs::File::create(part)
        .await
        .with_context(|| format!("Failed to create {}", part.display()))?;

    let mut written: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("Transfer from {} interrupted", url))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {}", part.display()))?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, params: &DownloadParams) -> DownloadResult {
        match self.try_download(params).await {
            Ok(result) => result,
            Err(e) => DownloadResult::failed(format!("{:#}", e)),
        }
    }
}

/// Lowercased extension of the URL path, ignoring query and fragment
fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_lowercase())
}

fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid stream header"),
        }
    }
    map
}

async fn merge_subtitles(video: &Path, subtitles: &[PathBuf], output: &Path) -> Result<()> {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y").arg("-loglevel").arg("error").arg("-i").arg(video);
    for subtitle in subtitles {
        cmd.arg("-i").arg(subtitle);
    }
    cmd.arg("-map").arg("0");
    for i in 1..=subtitles.len() {
        cmd.arg("-map").arg(i.to_string());
    }
    cmd.arg("-c").arg("copy").arg(output);

    let output_result = cmd
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to run ffmpeg")?;

    if !output_result.status.success() {
        let stderr = String::from_utf8_lossy(&output_result.stderr);
        bail!("ffmpeg merge failed: {}", stderr.trim());
    }

    info!(output = %output.display(), subtitles = subtitles.len(), "Merged subtitles");
    Ok(())
}
