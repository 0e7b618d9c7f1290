//! Batch run data model.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::UpstreamData;
use crate::types::{Artifact, Block, BlockId, BlockType};

/// Lifecycle of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Generating,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Lifecycle of a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Paused,
    Completed,
    Stopped,
}

impl BatchStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Stopped)
    }
}

/// Where a job's prompt came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSource {
    /// A selected block
    #[serde(rename_all = "camelCase")]
    Block {
        block_id: BlockId,
        number: String,
        block_type: BlockType,
    },
    /// Position of a prompt parsed from a file
    #[serde(rename_all = "camelCase")]
    PromptIndex { index: usize },
}

impl JobSource {
    pub fn block_id(&self) -> Option<&str> {
        match self {
            JobSource::Block { block_id, .. } => Some(block_id),
            JobSource::PromptIndex { .. } => None,
        }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            JobSource::Block { block_type, .. } => *block_type,
            JobSource::PromptIndex { .. } => BlockType::Text,
        }
    }
}

/// One unit of scheduled work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub source: JobSource,
    /// Prompt sent to the generator, preamble included
    pub prompt: String,
    pub status: JobStatus,
    /// 0-100
    pub progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a pending job that failed before may run again
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    pub artifact: Option<Artifact>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(source: JobSource, prompt: String, max_retries: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            prompt,
            status: JobStatus::Pending,
            progress: 0,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_at: None,
            artifact: None,
            error: None,
        }
    }

    /// Pending and past its retry delay
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.retry_at.map_or(true, |at| at <= now)
    }

    /// Duration of the last attempt, once finished
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds().max(0) as u64)
    }
}

/// Jobs started together, with derived counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRun {
    pub id: String,
    pub jobs: Vec<Job>,
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Items skipped while building the run
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub model_settings: serde_json::Value,
    #[serde(default)]
    pub reference: Option<ReferenceArtifact>,
}

impl BatchRun {
    pub fn new(jobs: Vec<Job>, warnings: Vec<String>, model_settings: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            jobs,
            status: BatchStatus::Processing,
            started_at: Utc::now(),
            completed_at: None,
            warnings,
            model_settings,
            reference: None,
        }
    }

    pub fn total(&self) -> usize {
        self.jobs.len()
    }

    fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn completed(&self) -> usize {
        self.count(JobStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(JobStatus::Failed)
    }

    pub fn pending(&self) -> usize {
        self.count(JobStatus::Pending)
    }

    pub fn generating(&self) -> usize {
        self.count(JobStatus::Generating)
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    pub fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }

    /// No job left to dispatch or waiting on a result
    pub fn is_drained(&self) -> bool {
        self.jobs.iter().all(|j| j.status.is_terminal())
    }

    /// Counters recomputed from the job list
    pub fn progress(&self) -> BatchProgress {
        let total = self.total();
        let completed = self.completed();
        let failed = self.failed();
        let percent = if total == 0 {
            0.0
        } else {
            (completed + failed) as f64 / total as f64 * 100.0
        };
        BatchProgress {
            batch_id: self.id.clone(),
            status: self.status,
            total,
            completed,
            failed,
            pending: self.pending(),
            generating: self.generating(),
            percent,
            eta_ms: None,
        }
    }
}

/// Snapshot of a run's counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub generating: usize,
    pub percent: f64,
    /// Predicted time to completion
    pub eta_ms: Option<u64>,
}

/// Items a batch is built from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchSource {
    /// Selected blocks; blank ones are skipped
    Blocks { blocks: Vec<Block> },
    /// Prompts already parsed from a file
    Prompts { prompts: Vec<String> },
    /// A prompt file to parse
    File { path: PathBuf },
}

/// Anchor artifact that keeps generated output consistent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceArtifact {
    pub artifact: Artifact,
    /// Label used in the preamble, e.g. the block number
    #[serde(default)]
    pub label: Option<String>,
}

/// Arguments to [`BatchProcessor::start`](super::BatchProcessor::start)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub source: BatchSource,
    /// Replacement prompts keyed by item position in the source.
    ///
    /// A blank override is ignored and the item keeps its own text; a block
    /// whose own content is blank too is skipped.
    #[serde(default)]
    pub prompt_overrides: HashMap<usize, String>,
    #[serde(default)]
    pub reference: Option<ReferenceArtifact>,
    #[serde(default)]
    pub model_settings: serde_json::Value,
}

impl BatchRequest {
    pub fn blocks(blocks: Vec<Block>) -> Self {
        Self::from_source(BatchSource::Blocks { blocks })
    }

    pub fn prompts(prompts: Vec<String>) -> Self {
        Self::from_source(BatchSource::Prompts { prompts })
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::from_source(BatchSource::File { path: path.into() })
    }

    fn from_source(source: BatchSource) -> Self {
        Self {
            source,
            prompt_overrides: HashMap::new(),
            reference: None,
            model_settings: serde_json::Value::Null,
        }
    }

    pub fn with_override(mut self, index: usize, prompt: impl Into<String>) -> Self {
        self.prompt_overrides.insert(index, prompt.into());
        self
    }

    pub fn with_reference(mut self, reference: ReferenceArtifact) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_model_settings(mut self, settings: serde_json::Value) -> Self {
        self.model_settings = settings;
        self
    }
}

/// Everything the generator receives for one attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub batch_id: String,
    pub job_id: String,
    pub source: JobSource,
    pub prompt: String,
    pub model_settings: serde_json::Value,
    pub reference: Option<ReferenceArtifact>,
    /// Content of blocks feeding the source block, oldest first
    pub upstream: Vec<UpstreamData>,
    /// Zero on the first attempt
    pub attempt: u32,
}
