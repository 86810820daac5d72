//! Sliding-window rate limiter for metadata API requests.
//!
//! Enforces a minimum interval between requests and a cap on requests in
//! any 60 second window.

use shared::config::RateLimitConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    max_per_minute: usize,
    /// Request timestamps inside the current window, oldest first
    recent: VecDeque<Instant>,
}

impl RateLimiter {
    /// Non-positive limits disable the corresponding constraint
    pub fn new(max_per_second: f64, max_per_minute: u32) -> Self {
        let min_interval = if max_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / max_per_second)
        } else {
            Duration::ZERO
        };
        let max_per_minute = if max_per_minute == 0 {
            usize::MAX
        } else {
            max_per_minute as usize
        };

        Self {
            min_interval,
            max_per_minute,
            recent: VecDeque::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_second, config.requests_per_minute)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent.front() {
            if now.duration_since(oldest) < WINDOW {
                break;
            }
            self.recent.pop_front();
        }
    }

    /// How long the next request has to wait, zero if it may go now
    fn wait_time(&mut self, now: Instant) -> Duration {
        self.prune(now);

        let per_second = self
            .recent
            .back()
            .map(|&last| self.min_interval.saturating_sub(now.duration_since(last)))
            .unwrap_or(Duration::ZERO);

        let per_minute = if self.recent.len() >= self.max_per_minute {
            self.recent
                .front()
                .map(|&oldest| WINDOW.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        per_second.max(per_minute)
    }

    /// Wait until a request may be made, then record it
    pub async fn acquire(&mut self) {
        loop {
            let wait = self.wait_time(Instant::now());
            if wait.is_zero() {
                break;
            }
            debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            sleep(wait).await;
        }

        self.recent.push_back(Instant::now());
    }

    /// Requests made in the last minute
    pub fn current_minute_count(&mut self) -> usize {
        self.prune(Instant::now());
        self.recent.len()
    }
}
