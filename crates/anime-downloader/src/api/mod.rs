//! Metadata API clients.
//!
//! A metadata API is the authority for [`MediaItem`] snapshots; its ids are
//! the ones the registry is keyed by.

pub mod client;
pub mod rate_limiter;
pub mod types;

pub use client::JikanClient;
pub use rate_limiter::RateLimiter;

use anyhow::Result;
use async_trait::async_trait;
use shared::MediaItem;

#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// Tag used to partition the registry, e.g. "jikan"
    fn api_name(&self) -> &str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MediaItem>>;

    /// `Ok(None)` when the id is unknown to the API
    async fn get_media(&self, id: i64) -> Result<Option<MediaItem>>;
}
