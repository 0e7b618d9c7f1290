use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    #[default]
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

/// One artifact scheduled for download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub id: String,
    /// `http(s)` URL or `data:` URI
    pub url: String,
    /// Destination file name, before de-duplication
    pub filename: String,
    pub status: DownloadStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub execution_id: Option<String>,
    pub batch_id: Option<String>,
    /// Where the file was written, once completed
    pub path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadItem {
    pub fn new(url: impl Into<String>, filename: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            filename: filename.into(),
            status: DownloadStatus::Pending,
            retry_count: 0,
            max_retries,
            execution_id: None,
            batch_id: None,
            path: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// How file names of one download batch are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NamingPolicy {
    /// Keep the suggested or URL-derived name
    #[default]
    Original,
    /// Prefix a zero-padded position, e.g. `001_clip.mp4`
    Sequential,
    /// Prefix the batch's enqueue time, e.g. `20240131_120000_clip.mp4`
    Timestamp,
}

/// Shared ids and naming for [`DownloadManager::enqueue_batch`](super::DownloadManager::enqueue_batch)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grouping {
    /// Run the downloads belong to
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Generated when absent
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub naming: NamingPolicy,
}

/// One artifact to add to a download batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: None,
        }
    }

    pub fn named(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: Some(filename.into()),
        }
    }
}
