//! File path utilities for the registry and download directories.
//!
//! This module is the one place that knows the on-disk layout:
//!
//! ```text
//! <media_dir>/<api>/<media_id>.json     per-media record
//! <media_dir>/registry.lock             lock sentinel
//! <index_dir>/registry.json             index document
//! <downloads_dir>/<title>/<episode>.<ext>
//! ```

use std::path::{Path, PathBuf};

/// Index document file name
pub const INDEX_FILE_NAME: &str = "registry.json";

/// Lock sentinel file name
pub const LOCK_FILE_NAME: &str = "registry.lock";

/// Path manager for registry files
#[derive(Debug, Clone)]
pub struct RegistryPaths {
    media_dir: PathBuf,
    index_dir: PathBuf,
}

impl RegistryPaths {
    pub fn new(media_dir: impl AsRef<Path>, index_dir: impl AsRef<Path>) -> Self {
        Self {
            media_dir: media_dir.as_ref().to_path_buf(),
            index_dir: index_dir.as_ref().to_path_buf(),
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// Directory holding all records of one metadata source
    pub fn api_dir(&self, media_api: &str) -> PathBuf {
        self.media_dir.join(sanitize_filename(media_api))
    }

    /// Record file for a media id
    pub fn record_file(&self, media_api: &str, media_id: i64) -> PathBuf {
        self.api_dir(media_api).join(format!("{}.json", media_id))
    }

    pub fn index_file(&self) -> PathBuf {
        self.index_dir.join(INDEX_FILE_NAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.media_dir.join(LOCK_FILE_NAME)
    }

    /// Create the registry directories
    pub fn create_dirs(&self, media_api: &str) -> std::io::Result<()> {
        for dir in [self.api_dir(media_api), self.index_dir.clone()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Path manager for downloaded episodes
#[derive(Debug, Clone)]
pub struct DownloadPaths {
    root: PathBuf,
}

impl DownloadPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one title
    pub fn title_dir(&self, title: &str) -> PathBuf {
        self.root.join(sanitize_filename(title))
    }

    /// Video file for an episode
    pub fn episode_file(&self, title: &str, episode: &str, extension: &str) -> PathBuf {
        self.title_dir(title)
            .join(format!("{}.{}", sanitize_filename(episode), extension))
    }

    /// Subtitle file for an episode
    pub fn subtitle_file(&self, title: &str, episode: &str, language: &str, extension: &str) -> PathBuf {
        self.title_dir(title).join(format!(
            "{}.{}.{}",
            sanitize_filename(episode),
            sanitize_filename(language),
            extension
        ))
    }
}

/// Sanitize filename by removing/replacing invalid characters.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect::<String>()
        .trim()
        .trim_matches('.')
        .to_string()
}
