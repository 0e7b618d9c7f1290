//! Download orchestrator.
//!
//! Persists job artifacts to disk, grouped by batch and by execution, with
//! an independent retry budget and progress at three granularities.

pub mod fetcher;
pub mod manager;
pub mod naming;
pub mod progress;
pub mod types;

pub use fetcher::{decode_data_uri, ArtifactFetcher, HttpFetcher};
pub use manager::{DownloadManager, Notifier};
pub use progress::{DownloadProgress, GroupProgress, ProgressCounts};
pub use types::{DownloadItem, DownloadRequest, DownloadStatus, Grouping, NamingPolicy};
