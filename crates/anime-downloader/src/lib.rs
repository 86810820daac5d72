//! Episode download orchestration on top of the shared registry.
//!
//! - [`api`]: metadata API clients (Jikan)
//! - [`provider`]: content providers that resolve titles to streams
//! - [`downloader`]: file transfer
//! - [`service`]: the download job pool
//! - [`worker`]: the periodic background worker

pub mod api;
pub mod downloader;
pub mod error;
pub mod provider;
pub mod service;
pub mod worker;

pub use api::{JikanClient, MetadataApi};
pub use downloader::{DownloadParams, DownloadResult, Downloader, HttpDownloader};
pub use error::JobError;
pub use provider::{CommandProvider, ContentProvider, TranslationType};
pub use service::{CompletedDownload, DownloadService};
pub use worker::{BackgroundWorkerService, NotificationService};
