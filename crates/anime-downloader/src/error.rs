//! Failure kinds of a single download job.

use crate::provider::TranslationType;
use shared::RegistryError;
use thiserror::Error;

/// Why a download job failed. The `Display` text is what ends up in the
/// episode's `last_error`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Media {media_id} has no registry record")]
    RecordMissing { media_id: i64 },

    #[error("Media {media_id} has no searchable title")]
    NoSearchableTitle { media_id: i64 },

    #[error("Provider {provider} returned no results for '{title}'")]
    NoSearchResults { provider: String, title: String },

    #[error("Episode {episode} is not available ({translation}) for '{title}'")]
    EpisodeNotAvailable {
        title: String,
        episode: String,
        translation: TranslationType,
    },

    #[error("No servers available for episode {episode}")]
    NoServers { episode: String },

    #[error("Server {server} has no stream links")]
    NoStreamLinks { server: String },

    #[error("Provider error: {0:#}")]
    Provider(anyhow::Error),

    #[error("Download failed: {0}")]
    Download(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
