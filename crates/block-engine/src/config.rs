//! Engine configuration
//!
//! One serde document with a section per component. Every section is
//! `#[serde(default)]` so partial files load with defaults filled in.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::constants::{self, storage::CONFIG_FILE};
use crate::error::{EngineError, Result};

/// Batch job queue settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchConfig {
    /// Concurrent generation workers
    pub workers: usize,
    /// Failed attempts allowed per job before it is marked failed
    pub max_retries: u32,
    /// Delay before a failed job is eligible again
    pub retry_delay_ms: u64,
    /// How long to wait before re-checking admission when resources are constrained
    pub admission_backoff_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: constants::batch::WORKERS,
            max_retries: constants::batch::MAX_RETRIES,
            retry_delay_ms: constants::batch::RETRY_DELAY_MS,
            admission_backoff_ms: constants::batch::ADMISSION_BACKOFF_MS,
        }
    }
}

impl BatchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn admission_backoff(&self) -> Duration {
        Duration::from_millis(self.admission_backoff_ms)
    }
}

/// Provider-declared request caps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Requests allowed in any sliding one-minute window (0 = unlimited)
    pub requests_per_minute: u32,
    /// Requests allowed per second (0 = no minimum spacing)
    pub requests_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: constants::rate_limit::REQUESTS_PER_MINUTE,
            requests_per_second: constants::rate_limit::REQUESTS_PER_SECOND,
        }
    }
}

impl RateLimitConfig {
    /// Minimum spacing between two requests
    pub fn min_interval(&self) -> Duration {
        if self.requests_per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(1_000 / u64::from(self.requests_per_second))
        }
    }
}

/// Thresholds above which the resource monitor reports "constrained"
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceThresholds {
    pub memory_percent: f32,
    pub cpu_percent: f32,
    pub max_connections: usize,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_percent: constants::resources::MEMORY_PERCENT,
            cpu_percent: constants::resources::CPU_PERCENT,
            max_connections: constants::resources::MAX_CONNECTIONS,
        }
    }
}

/// How the download orchestrator drains its queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMode {
    /// Bounded chunks started together
    #[default]
    Concurrent,
    /// One item at a time with a fixed pause between items
    Sequential,
}

/// Download orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadConfig {
    /// Destination directory
    pub download_dir: PathBuf,
    /// Place files under `<executionId>/<batchId>/` inside the destination
    pub group_into_folders: bool,
    pub mode: DownloadMode,
    /// Items started together in concurrent mode
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Pause between items in sequential mode
    pub sequential_delay_ms: u64,
    /// Send a user notification when a download batch completes
    pub notify_on_complete: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from(constants::download::DIR),
            group_into_folders: false,
            mode: DownloadMode::default(),
            chunk_size: constants::download::CHUNK_SIZE,
            max_retries: constants::download::MAX_RETRIES,
            retry_delay_ms: constants::download::RETRY_DELAY_MS,
            sequential_delay_ms: constants::download::SEQUENTIAL_DELAY_MS,
            notify_on_complete: true,
        }
    }
}

impl DownloadConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn sequential_delay(&self) -> Duration {
        Duration::from_millis(self.sequential_delay_ms)
    }
}

/// Execution history settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryConfig {
    /// Records kept before the oldest are evicted
    pub max_records: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_records: constants::history::MAX_RECORDS,
        }
    }
}

/// Prompt file parsing limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PromptFileOptions {
    /// Shortest accepted prompt after trimming
    pub min_length: usize,
    /// Prompts kept from one file; the excess is reported as a warning
    pub max_prompts: usize,
}

impl Default for PromptFileOptions {
    fn default() -> Self {
        Self {
            min_length: constants::prompt_file::MIN_LENGTH,
            max_prompts: constants::prompt_file::MAX_PROMPTS,
        }
    }
}

/// Graph validation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct GraphConfig {
    /// Edge count above which validation adds an advisory warning
    pub edge_warning_threshold: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            edge_warning_threshold: constants::graph::EDGE_WARNING_THRESHOLD,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub batch: BatchConfig,
    pub rate_limit: RateLimitConfig,
    pub resources: ResourceThresholds,
    pub download: DownloadConfig,
    pub history: HistoryConfig,
    pub prompt_file: PromptFileOptions,
    pub graph: GraphConfig,
}

impl EngineConfig {
    /// Load configuration from `dir/engine.json`, or defaults if absent
    pub async fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let config_path = dir.as_ref().join(CONFIG_FILE);

        if !config_path.exists() {
            log::debug!("No engine config at {:?}, using defaults", config_path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        log::info!("Engine configuration loaded from {:?}", config_path);
        Ok(config)
    }

    /// Save configuration to `dir/engine.json`
    pub async fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        fs::create_dir_all(dir.as_ref()).await?;

        let config_path = dir.as_ref().join(CONFIG_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, contents).await?;

        log::info!("Engine configuration saved to {:?}", config_path);
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch.workers == 0 {
            return Err(EngineError::Config("batch.workers must be at least 1".into()));
        }
        if self.download.chunk_size == 0 {
            return Err(EngineError::Config("download.chunkSize must be at least 1".into()));
        }
        if self.prompt_file.max_prompts == 0 {
            return Err(EngineError::Config("promptFile.maxPrompts must be at least 1".into()));
        }
        if self.history.max_records == 0 {
            return Err(EngineError::Config("history.maxRecords must be at least 1".into()));
        }
        if !(0.0..=100.0).contains(&self.resources.memory_percent)
            || !(0.0..=100.0).contains(&self.resources.cpu_percent)
        {
            return Err(EngineError::Config(
                "resource thresholds must be percentages between 0 and 100".into(),
            ));
        }
        Ok(())
    }
}
