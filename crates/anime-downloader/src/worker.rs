//! Long-running background worker.
//!
//! Periodically checks notifications, resumes unfinished downloads and
//! retries failed ones, each on its own interval.

use crate::service::DownloadService;
use anyhow::Result;
use async_trait::async_trait;
use shared::WorkerConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Source of new-episode notifications
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn check_and_display_notifications(&self) -> Result<()>;
}

pub struct BackgroundWorkerService {
    config: WorkerConfig,
    downloads: Arc<DownloadService>,
    notifications: Option<Arc<dyn NotificationService>>,
    stopped: AtomicBool,
    wake: Notify,
}

impl BackgroundWorkerService {
    pub fn new(
        config: WorkerConfig,
        downloads: Arc<DownloadService>,
        notifications: Option<Arc<dyn NotificationService>>,
    ) -> Self {
        Self {
            config,
            downloads,
            notifications,
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Ask the run loop to exit; takes effect within one tick at most
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn check_notifications(&self) {
        let Some(notifications) = &self.notifications else {
            debug!("No notification service configured");
            return;
        };
        if let Err(e) = notifications.check_and_display_notifications().await {
            error!(error = %e, "Notification check failed");
        }
    }

    /// Run until [`stop`](Self::stop), Ctrl-C or SIGTERM.
    ///
    /// Every task is due on the first iteration. On exit the download
    /// service is shut down without waiting for running jobs.
    pub async fn run(&self) -> Result<()> {
        info!(
            notification_minutes = self.config.notification_check_interval_minutes,
            download_minutes = self.config.download_check_interval_minutes,
            retry_minutes = self.config.failed_retry_interval_minutes,
            "Background worker started"
        );

        let signal = shutdown_signal();
        tokio::pin!(signal);

        let start = Instant::now();
        let mut next_notification = start;
        let mut next_download = start;
        let mut next_retry = start;

        while !self.is_stopped() {
            let now = Instant::now();

            if now >= next_notification {
                self.check_notifications().await;
                next_notification = now + self.config.notification_interval();
            }

            if now >= next_download {
                let resumed = self.downloads.resume_unfinished_downloads().await;
                debug!(resumed, "Download check finished");
                next_download = now + self.config.download_interval();
            }

            if now >= next_retry {
                let retried = self.downloads.retry_failed_downloads().await;
                debug!(retried, "Failed download check finished");
                next_retry = now + self.config.failed_retry_interval();
            }

            let next_due = next_notification.min(next_download).min(next_retry);
            let wait = next_due
                .saturating_duration_since(Instant::now())
                .min(self.config.tick());

            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.wake.notified() => {}
                _ = &mut signal => {
                    info!("Shutdown signal received");
                    self.stop();
                }
            }
        }

        info!("Background worker stopping");
        self.downloads.shutdown(false).await;
        Ok(())
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
