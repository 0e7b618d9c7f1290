//! Execution history.
//!
//! Records are kept oldest first and capped; the oldest are evicted when a
//! new one would exceed the cap. The whole list is persisted after every
//! mutation.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;

use super::statistics::{self, HistoryStatistics};
use super::types::{duration_ms, BlockResult, ExecutionConfig, ExecutionRecord, ExecutionStatus, HistoryFilter};
use crate::config::HistoryConfig;
use crate::constants::storage::EXECUTION_HISTORY_KEY;
use crate::error::{EngineError, Result};
use crate::events::{emit, EngineEvent, EventSink, NullEventSink};
use crate::store::{load_versioned, save_versioned, KvStore};

/// Durable log of execution runs and their per-block outcomes
pub struct ExecutionHistory {
    max_records: usize,
    store: Option<Arc<dyn KvStore>>,
    events: Arc<dyn EventSink>,
    records: Mutex<Vec<ExecutionRecord>>,
}

impl ExecutionHistory {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            max_records: config.max_records.max(1),
            store: None,
            events: Arc::new(NullEventSink),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Persist to `store`. Call [`load`](Self::load) to read existing records.
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replace the in-memory records with the persisted list.
    ///
    /// Returns the number of records loaded.
    pub fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut loaded: Vec<ExecutionRecord> =
            load_versioned(store.as_ref(), EXECUTION_HISTORY_KEY)?.unwrap_or_default();
        loaded.sort_by_key(|r| r.started_at);
        self.evict(&mut loaded);

        let count = loaded.len();
        *self.records.lock() = loaded;
        log::debug!("Loaded {} execution records", count);
        Ok(count)
    }

    /// Start a record in `running` status. Returns its id.
    pub fn begin(&self, config: ExecutionConfig, total_items: usize) -> String {
        let record = ExecutionRecord::begin(config, total_items, Utc::now());
        let id = record.id.clone();
        let template_id = record.template_id.clone();

        self.mutate(|records| {
            records.push(record);
        });

        log::info!("Execution {} started ({} items)", id, total_items);
        emit(
            self.events.as_ref(),
            EngineEvent::ExecutionStarted {
                execution_id: id.clone(),
                template_id,
            },
        );
        id
    }

    /// Upsert one block's outcome and recount the record
    pub fn record_block_result(&self, execution_id: &str, result: BlockResult) -> Result<()> {
        self.try_mutate(|records| {
            let record = running_record(records, execution_id)?;
            record.upsert_result(result);
            Ok(())
        })
    }

    /// Stamp the end time and a terminal status.
    ///
    /// The record is immutable afterwards.
    pub fn finish(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<ExecutionRecord> {
        if !status.is_terminal() {
            return Err(EngineError::Config(format!(
                "execution {} cannot finish as {:?}",
                execution_id, status
            )));
        }
        self.finish_at(execution_id, status, error, Utc::now())
    }

    fn finish_at(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRecord> {
        let record = self.try_mutate(|records| {
            let record = running_record(records, execution_id)?;
            record.status = status;
            record.ended_at = Some(now);
            record.duration_ms = Some(duration_ms(record.started_at, now));
            record.error = error;
            Ok(record.clone())
        })?;

        log::info!(
            "Execution {} finished as {:?}: {} completed, {} failed, {} skipped",
            record.id,
            record.status,
            record.completed,
            record.failed,
            record.skipped
        );
        emit(
            self.events.as_ref(),
            EngineEvent::ExecutionFinished {
                execution_id: record.id.clone(),
                status: record.status,
            },
        );
        Ok(record)
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.id == execution_id)
            .cloned()
    }

    /// Matching records, newest first
    pub fn list(&self, filter: &HistoryFilter) -> Vec<ExecutionRecord> {
        let records = self.records.lock();
        records
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Configuration to start the same run again
    pub fn replay_config(&self, execution_id: &str) -> Result<ExecutionConfig> {
        self.get(execution_id)
            .map(|r| r.config)
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    pub fn delete(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.try_mutate(|records| {
            let index = records
                .iter()
                .position(|r| r.id == execution_id)
                .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
            Ok(records.remove(index))
        })
    }

    pub fn clear(&self) {
        self.mutate(|records| records.clear());
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// All records as a pretty JSON array, oldest first
    pub fn export_json(&self) -> Result<String> {
        let records = self.records.lock();
        Ok(serde_json::to_string_pretty(&*records)?)
    }

    /// Merge records exported by [`export_json`](Self::export_json).
    ///
    /// Ids already present are skipped; the cap applies to the merged list.
    /// Returns the number of records added.
    pub fn import_json(&self, json: &str) -> Result<usize> {
        let incoming: Vec<ExecutionRecord> = serde_json::from_str(json)?;

        let added = self.mutate(|records| {
            let mut added = 0;
            for record in incoming {
                if records.iter().any(|r| r.id == record.id) {
                    continue;
                }
                records.push(record);
                added += 1;
            }
            records.sort_by_key(|r| r.started_at);
            added
        });

        log::info!("Imported {} execution records", added);
        Ok(added)
    }

    /// Aggregates over the matching records, with a histogram ending today
    pub fn statistics(&self, filter: &HistoryFilter) -> HistoryStatistics {
        self.statistics_on(filter, Utc::now().date_naive())
    }

    /// [`statistics`](Self::statistics) with the histogram ending on `today`
    pub fn statistics_on(&self, filter: &HistoryFilter, today: NaiveDate) -> HistoryStatistics {
        let records = self.records.lock();
        statistics::compute(records.iter().filter(|r| filter.matches(r)), today)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<ExecutionRecord>) -> T) -> T {
        let mut records = self.records.lock();
        let out = f(&mut records);
        self.evict(&mut records);
        self.persist(&records);
        out
    }

    /// Like `mutate`, but nothing is persisted when `f` fails
    fn try_mutate<T>(&self, f: impl FnOnce(&mut Vec<ExecutionRecord>) -> Result<T>) -> Result<T> {
        let mut records = self.records.lock();
        let out = f(&mut records)?;
        self.evict(&mut records);
        self.persist(&records);
        Ok(out)
    }

    /// Drop records over the cap: oldest finished ones first, then oldest running ones
    fn evict(&self, records: &mut Vec<ExecutionRecord>) {
        if records.len() <= self.max_records {
            return;
        }
        let excess = records.len() - self.max_records;

        let mut evict = vec![false; records.len()];
        let finished = (0..records.len()).filter(|&i| records[i].status.is_terminal());
        let running = (0..records.len()).filter(|&i| !records[i].status.is_terminal());
        for i in finished.chain(running).take(excess) {
            evict[i] = true;
        }

        let mut index = 0;
        records.retain(|_| {
            let keep = !evict[index];
            index += 1;
            keep
        });
        log::info!("Evicted {} execution records over the cap of {}", excess, self.max_records);
    }

    fn persist(&self, records: &[ExecutionRecord]) {
        if let Some(store) = &self.store {
            if let Err(e) = save_versioned(store.as_ref(), EXECUTION_HISTORY_KEY, &records) {
                log::warn!("Failed to persist execution history: {}", e);
            }
        }
    }
}

fn running_record<'a>(
    records: &'a mut [ExecutionRecord],
    execution_id: &str,
) -> Result<&'a mut ExecutionRecord> {
    let record = records
        .iter_mut()
        .find(|r| r.id == execution_id)
        .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
    if record.status.is_terminal() {
        return Err(EngineError::ExecutionFinished(execution_id.to_string()));
    }
    Ok(record)
}
