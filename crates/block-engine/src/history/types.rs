//! Execution record types

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::BlockId;

/// Lifecycle of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Records in a terminal status are immutable
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Outcome of one block within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockResultStatus {
    Completed,
    Failed,
    Skipped,
}

/// One block's result, upserted by block id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResult {
    pub block_id: BlockId,
    pub status: BlockResultStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Prompt sent to the generator
    #[serde(default)]
    pub input: String,
    /// Produced text or artifact URL
    pub output: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub error: Option<String>,
}

impl BlockResult {
    pub fn completed(block_id: impl Into<String>, input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::new(block_id, BlockResultStatus::Completed, input)
        }
    }

    pub fn failed(block_id: impl Into<String>, input: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(block_id, BlockResultStatus::Failed, input)
        }
    }

    pub fn skipped(block_id: impl Into<String>) -> Self {
        Self::new(block_id, BlockResultStatus::Skipped, "")
    }

    fn new(block_id: impl Into<String>, status: BlockResultStatus, input: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            status,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            input: input.into(),
            output: None,
            retry_count: 0,
            error: None,
        }
    }

    /// Set start and end times; the duration follows from them
    pub fn with_timing(mut self, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self.ended_at = Some(ended_at);
        self.duration_ms = Some(duration_ms(started_at, ended_at));
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Everything needed to start the same run again
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionConfig {
    pub template_id: String,
    pub template_name: String,
    /// Blocks selected for the run, in order
    pub block_ids: Vec<BlockId>,
    /// Provider and model parameters, opaque to the engine
    pub model_settings: serde_json::Value,
    pub workers: Option<usize>,
}

impl ExecutionConfig {
    pub fn new(template_id: impl Into<String>, template_name: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            template_name: template_name.into(),
            ..Self::default()
        }
    }

    pub fn with_blocks(mut self, block_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.block_ids = block_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model_settings(mut self, model_settings: serde_json::Value) -> Self {
        self.model_settings = model_settings;
        self
    }
}

/// Persisted summary of one end-to-end run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub template_id: String,
    pub template_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub total_items: usize,
    /// Derived from `block_results`
    pub completed: usize,
    /// Derived from `block_results`
    pub failed: usize,
    /// Derived from `block_results`
    pub skipped: usize,
    pub block_results: Vec<BlockResult>,
    pub config: ExecutionConfig,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub(crate) fn begin(config: ExecutionConfig, total_items: usize, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            template_id: config.template_id.clone(),
            template_name: config.template_name.clone(),
            status: ExecutionStatus::Running,
            started_at: now,
            ended_at: None,
            duration_ms: None,
            total_items,
            completed: 0,
            failed: 0,
            skipped: 0,
            block_results: Vec::new(),
            config,
            error: None,
        }
    }

    /// Insert or replace the result for `result.block_id`, then recount
    pub(crate) fn upsert_result(&mut self, result: BlockResult) {
        match self
            .block_results
            .iter_mut()
            .find(|r| r.block_id == result.block_id)
        {
            Some(existing) => *existing = result,
            None => self.block_results.push(result),
        }
        self.recount();
    }

    fn recount(&mut self) {
        let (mut completed, mut failed, mut skipped) = (0, 0, 0);
        for result in &self.block_results {
            match result.status {
                BlockResultStatus::Completed => completed += 1,
                BlockResultStatus::Failed => failed += 1,
                BlockResultStatus::Skipped => skipped += 1,
            }
        }
        self.completed = completed;
        self.failed = failed;
        self.skipped = skipped;
    }

    pub fn started_on(&self) -> NaiveDate {
        self.started_at.date_naive()
    }
}

/// Narrows `list` and `statistics`; empty fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryFilter {
    pub template_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    /// Inclusive lower bound on `started_at`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`
    pub until: Option<DateTime<Utc>>,
    /// Newest first, at most this many
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn template(template_id: impl Into<String>) -> Self {
        Self {
            template_id: Some(template_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.template_id
            .as_deref()
            .map_or(true, |t| t == record.template_id)
            && self.status.map_or(true, |s| s == record.status)
            && self.since.map_or(true, |t| record.started_at >= t)
            && self.until.map_or(true, |t| record.started_at < t)
    }
}

pub(crate) fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}
