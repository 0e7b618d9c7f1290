//! Download progress views.
//!
//! Every view is recomputed from the item list on request; nothing here is
//! stored between calls.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::types::{DownloadItem, DownloadStatus};

/// Counters over a set of download items
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCounts {
    pub total: usize,
    pub pending: usize,
    pub downloading: usize,
    pub completed: usize,
    pub failed: usize,
    /// Settled share of the total, 0-100
    pub percent: f64,
}

impl ProgressCounts {
    pub fn from_items<'a, I>(items: I) -> Self
    where
        I: IntoIterator<Item = &'a DownloadItem>,
    {
        let mut counts = Self::default();
        for item in items {
            counts.add(item.status);
        }
        counts.finish()
    }

    fn add(&mut self, status: DownloadStatus) {
        self.total += 1;
        match status {
            DownloadStatus::Pending => self.pending += 1,
            DownloadStatus::Downloading => self.downloading += 1,
            DownloadStatus::Completed => self.completed += 1,
            DownloadStatus::Failed => self.failed += 1,
        }
    }

    fn finish(mut self) -> Self {
        self.percent = if self.total == 0 {
            0.0
        } else {
            (self.completed + self.failed) as f64 / self.total as f64 * 100.0
        };
        self
    }

    /// At least one item, and none pending or downloading
    pub fn is_settled(&self) -> bool {
        self.total > 0 && self.pending == 0 && self.downloading == 0
    }
}

/// Counters for one batch or execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupProgress {
    pub id: String,
    #[serde(flatten)]
    pub counts: ProgressCounts,
}

/// Progress at every granularity at once
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub overall: ProgressCounts,
    /// Sorted by batch id
    pub batches: Vec<GroupProgress>,
    /// Sorted by execution id
    pub executions: Vec<GroupProgress>,
}

impl DownloadProgress {
    pub fn compute(items: &[DownloadItem]) -> Self {
        let mut overall = ProgressCounts::default();
        let mut batches: BTreeMap<&str, ProgressCounts> = BTreeMap::new();
        let mut executions: BTreeMap<&str, ProgressCounts> = BTreeMap::new();

        for item in items {
            overall.add(item.status);
            if let Some(batch_id) = &item.batch_id {
                batches.entry(batch_id.as_str()).or_default().add(item.status);
            }
            if let Some(execution_id) = &item.execution_id {
                executions.entry(execution_id.as_str()).or_default().add(item.status);
            }
        }

        let groups = |map: BTreeMap<&str, ProgressCounts>| -> Vec<GroupProgress> {
            map.into_iter()
                .map(|(id, counts)| GroupProgress {
                    id: id.to_string(),
                    counts: counts.finish(),
                })
                .collect()
        };

        Self {
            overall: overall.finish(),
            batches: groups(batches),
            executions: groups(executions),
        }
    }

    pub fn batch(&self, batch_id: &str) -> Option<&ProgressCounts> {
        self.batches
            .iter()
            .find(|g| g.id == batch_id)
            .map(|g| &g.counts)
    }

    pub fn execution(&self, execution_id: &str) -> Option<&ProgressCounts> {
        self.executions
            .iter()
            .find(|g| g.id == execution_id)
            .map(|g| &g.counts)
    }
}
