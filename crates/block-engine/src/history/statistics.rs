//! Aggregates derived from execution records.
//!
//! Nothing is counted incrementally: every figure is recomputed from the
//! records passed in, so statistics always agree with the stored list.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use super::types::{ExecutionRecord, ExecutionStatus};
use crate::constants::history::HISTOGRAM_DAYS;

/// Executions started on one calendar day (UTC)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCount {
    pub date: NaiveDate,
    pub executions: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStatistics {
    pub total_executions: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: usize,
    /// Completed share of finished executions, 0-1
    pub success_rate: f64,
    /// Mean duration of finished executions
    pub average_duration_ms: u64,
    /// Executions per template id
    pub template_usage: BTreeMap<String, usize>,
    /// One entry per day ending `today`, oldest first
    pub daily: Vec<DailyCount>,
}

/// Compute statistics over `records`, with the histogram ending on `today`
pub fn compute<'a, I>(records: I, today: NaiveDate) -> HistoryStatistics
where
    I: IntoIterator<Item = &'a ExecutionRecord>,
{
    let days = HISTOGRAM_DAYS.max(1) as u64;
    let first_day = today
        .checked_sub_days(Days::new(days - 1))
        .unwrap_or(NaiveDate::MIN);
    let mut daily: Vec<DailyCount> = first_day
        .iter_days()
        .take(days as usize)
        .map(|date| DailyCount {
            date,
            executions: 0,
            completed: 0,
            failed: 0,
        })
        .collect();

    let mut stats = HistoryStatistics::default();
    let mut duration_total: u64 = 0;
    let mut duration_count: u64 = 0;

    for record in records {
        stats.total_executions += 1;
        match record.status {
            ExecutionStatus::Running => stats.running += 1,
            ExecutionStatus::Completed => stats.completed += 1,
            ExecutionStatus::Failed => stats.failed += 1,
            ExecutionStatus::Cancelled => stats.cancelled += 1,
        }
        *stats
            .template_usage
            .entry(record.template_id.clone())
            .or_default() += 1;

        if let Some(duration) = record.duration_ms {
            duration_total += duration;
            duration_count += 1;
        }

        let offset = record.started_on().signed_duration_since(first_day).num_days();
        if let Some(day) = usize::try_from(offset).ok().and_then(|i| daily.get_mut(i)) {
            day.executions += 1;
            match record.status {
                ExecutionStatus::Completed => day.completed += 1,
                ExecutionStatus::Failed => day.failed += 1,
                _ => {}
            }
        }
    }

    let finished = stats.completed + stats.failed + stats.cancelled;
    if finished > 0 {
        stats.success_rate = stats.completed as f64 / finished as f64;
    }
    if duration_count > 0 {
        stats.average_duration_ms = duration_total / duration_count;
    }
    stats.daily = daily;
    stats
}
