//! Jikan API client with rate limiting and retry logic.

use super::rate_limiter::RateLimiter;
use super::types::{AnimeEntry, DataResponse, PaginatedResponse};
use super::MetadataApi;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use shared::config::MetadataApiConfig;
use shared::MediaItem;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Jikan's page size cap
const MAX_PAGE_SIZE: usize = 25;

/// Jikan API v4 client
pub struct JikanClient {
    client: Client,
    base_url: String,
    /// Shared by every request made through this client
    rate_limiter: Mutex<RateLimiter>,
    max_retries: u32,
    /// Base delay for exponential backoff
    retry_delay_ms: u64,
}

impl JikanClient {
    pub fn new(config: &MetadataApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("anime-downloader/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            rate_limiter: Mutex::new(RateLimiter::from_config(&config.rate_limit)),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(2u64.saturating_pow(attempt)))
    }

    /// GET with rate limiting and retries; `Ok(None)` on 404
    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            self.rate_limiter.lock().await.acquire().await;

            debug!(url = %url, attempt = attempt + 1, "Making API request");

            let response = match self.client.get(&url).query(query).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(url = %url, error = %e, "Request error");
                    last_error = Some(anyhow!(e).context(format!("Request to {} failed", url)));
                    if attempt < self.max_retries {
                        sleep(self.backoff(attempt)).await;
                    }
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let data = response
                    .json::<T>()
                    .await
                    .with_context(|| format!("Failed to parse response from {}", url))?;
                return Ok(Some(data));
            }

            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }

            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(url = %url, "Rate limited by server");
            } else if status.is_client_error() {
                // Retrying won't change a bad request
                return Err(anyhow!("Request failed with status {}: {}", status, body));
            } else {
                warn!(url = %url, status = %status, error = %body, "Request failed");
            }

            last_error = Some(anyhow!("Request failed with status {}: {}", status, body));
            if attempt < self.max_retries {
                let delay = self.backoff(attempt);
                debug!(delay_ms = delay.as_millis() as u64, "Retrying after delay");
                sleep(delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Request failed after all retries")))
    }
}

#[async_trait]
impl MetadataApi for JikanClient {
    fn api_name(&self) -> &str {
        "jikan"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MediaItem>> {
        info!(query = %query, limit, "Searching anime");
        let limit = limit.clamp(1, MAX_PAGE_SIZE);

        let response: Option<PaginatedResponse<AnimeEntry>> = self
            .get(
                "/anime",
                &[("q", query.to_string()), ("limit", limit.to_string())],
            )
            .await?;

        Ok(response
            .map(|r| r.data.into_iter().map(MediaItem::from).collect())
            .unwrap_or_default())
    }

    async fn get_media(&self, id: i64) -> Result<Option<MediaItem>> {
        debug!(media_id = id, "Fetching anime details");
        let response: Option<DataResponse<AnimeEntry>> =
            self.get(&format!("/anime/{}", id), &[]).await?;
        Ok(response.map(|r| MediaItem::from(r.data)))
    }
}
