//! Download orchestration.
//!
//! Items are queued by [`DownloadManager::enqueue`] or
//! [`DownloadManager::enqueue_batch`] and drained by
//! [`DownloadManager::process`], either in concurrent chunks or one at a time
//! with a fixed pause. Each item carries its own retry budget. Progress is
//! recomputed from the item list on every change.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::fetcher::ArtifactFetcher;
use super::naming::{apply_naming, resolve_filename, unique_destination};
use super::progress::{DownloadProgress, ProgressCounts};
use super::types::{DownloadItem, DownloadRequest, DownloadStatus, Grouping};
use crate::config::{DownloadConfig, DownloadMode};
use crate::error::{EngineError, Result};
use crate::events::{emit, EngineEvent, EventSink, NullEventSink};
use crate::scheduling::{ResourceMonitor, RetryDecision, RetryPolicy};

/// Folder used for items without an execution or batch id when grouping
const UNGROUPED_DIR: &str = "ungrouped";

/// User-facing notification channel, e.g. a desktop toast
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

#[derive(Default)]
struct DownloadState {
    items: Vec<DownloadItem>,
    /// Cancellation handles of items currently transferring
    tokens: HashMap<String, CancellationToken>,
    /// Destinations claimed by in-flight items
    reserved: HashSet<PathBuf>,
    /// Batches whose completion was already announced
    announced: HashSet<String>,
}

impl DownloadState {
    /// Forget announcements for batches that no longer have items
    fn prune_announced(&mut self) {
        let items = &self.items;
        self.announced
            .retain(|batch_id| items.iter().any(|i| i.batch_id.as_deref() == Some(batch_id.as_str())));
    }
}

/// An item claimed for transfer
struct Claim {
    id: String,
    url: String,
    dest: PathBuf,
    max_retries: u32,
    token: CancellationToken,
}

/// Queue of artifact downloads grouped by batch and execution
pub struct DownloadManager {
    config: DownloadConfig,
    fetcher: Arc<dyn ArtifactFetcher>,
    events: Arc<dyn EventSink>,
    notifier: Option<Arc<dyn Notifier>>,
    monitor: Option<Arc<ResourceMonitor>>,
    state: Mutex<DownloadState>,
    /// Held by the one `process` call draining the queue
    draining: tokio::sync::Mutex<()>,
}

impl DownloadManager {
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>, config: DownloadConfig) -> Self {
        Self {
            config,
            fetcher,
            events: Arc::new(NullEventSink),
            notifier: None,
            monitor: None,
            state: Mutex::new(DownloadState::default()),
            draining: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Notify the user when a batch completes (if enabled in the config)
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Shrink chunks while resources are constrained and count transfers as connections
    pub fn with_resource_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Queue one artifact. Returns the new item's id.
    pub fn enqueue(
        &self,
        url: impl Into<String>,
        filename: Option<String>,
        execution_id: Option<String>,
        batch_id: Option<String>,
    ) -> Result<String> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(EngineError::download("empty artifact URL"));
        }

        let filename = resolve_filename(&url, filename.as_deref(), Utc::now());
        let mut item = DownloadItem::new(url, filename, self.config.max_retries);
        item.execution_id = execution_id;
        item.batch_id = batch_id;
        let id = item.id.clone();

        log::debug!("Queued download {} as {}", id, item.filename);
        {
            let mut state = self.state.lock();
            if let Some(batch_id) = &item.batch_id {
                state.announced.remove(batch_id);
            }
            state.items.push(item);
        }
        self.emit_progress();
        Ok(id)
    }

    /// Queue several artifacts under one batch id, named by `grouping.naming`.
    ///
    /// Returns the batch id.
    pub fn enqueue_batch(&self, requests: Vec<DownloadRequest>, grouping: Grouping) -> Result<String> {
        if requests.is_empty() {
            return Err(EngineError::download("empty download batch"));
        }
        if let Some(request) = requests.iter().find(|r| r.url.trim().is_empty()) {
            return Err(EngineError::download(format!(
                "empty artifact URL in batch (filename {:?})",
                request.filename
            )));
        }

        let batch_id = grouping
            .batch_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        let total = requests.len();

        let items: Vec<DownloadItem> = requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| {
                let base = resolve_filename(&request.url, request.filename.as_deref(), now);
                let filename = apply_naming(grouping.naming, index, total, &base, now);
                let mut item = DownloadItem::new(request.url, filename, self.config.max_retries);
                item.batch_id = Some(batch_id.clone());
                item.execution_id = grouping.execution_id.clone();
                item
            })
            .collect();

        log::info!("Queued download batch {} with {} items", batch_id, total);
        {
            let mut state = self.state.lock();
            state.announced.remove(&batch_id);
            state.items.extend(items);
        }
        self.emit_progress();
        Ok(batch_id)
    }

    /// Download every pending item.
    ///
    /// Concurrent mode starts a chunk of items together and waits for all of
    /// them to settle before the next chunk; sequential mode runs one item at
    /// a time with a pause between items. Concurrent calls wait for the
    /// running drain to finish and then drain whatever is left.
    pub async fn process(&self) -> DownloadProgress {
        let _draining = self.draining.lock().await;

        loop {
            let limit = match self.config.mode {
                DownloadMode::Concurrent => self.chunk_size(),
                DownloadMode::Sequential => 1,
            };
            let claims = self.claim_pending(limit);
            if claims.is_empty() {
                break;
            }

            match self.config.mode {
                DownloadMode::Concurrent => {
                    join_all(claims.into_iter().map(|claim| self.transfer(claim))).await;
                }
                DownloadMode::Sequential => {
                    for claim in claims {
                        self.transfer(claim).await;
                    }
                    if self.has_pending() {
                        tokio::time::sleep(self.config.sequential_delay()).await;
                    }
                }
            }
        }

        self.progress()
    }

    /// Abort in-flight downloads and drop queued ones.
    ///
    /// In-flight items end `failed` with a cancellation reason. Returns how
    /// many items were affected.
    pub fn cancel(&self) -> usize {
        let affected = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let dropped = state
                .items
                .iter()
                .filter(|i| i.status == DownloadStatus::Pending)
                .count();
            state.items.retain(|i| i.status != DownloadStatus::Pending);

            let reason = EngineError::Cancelled.to_string();
            let now = Utc::now();
            let mut cancelled = 0;
            for item in state
                .items
                .iter_mut()
                .filter(|i| i.status == DownloadStatus::Downloading)
            {
                if let Some(token) = state.tokens.remove(&item.id) {
                    token.cancel();
                }
                item.status = DownloadStatus::Failed;
                item.error = Some(reason.clone());
                item.completed_at = Some(now);
                cancelled += 1;
            }

            log::info!(
                "Cancelled {} downloads, dropped {} queued",
                cancelled,
                dropped
            );
            cancelled + dropped
        };

        self.emit_progress();
        self.announce_completed_batches();
        affected
    }

    /// Cancel one item: a transfer in progress ends `failed`, a queued item is dropped
    pub fn cancel_item(&self, item_id: &str) -> Result<()> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let index = state
                .items
                .iter()
                .position(|i| i.id == item_id)
                .ok_or_else(|| EngineError::DownloadNotFound(item_id.to_string()))?;

            match state.items[index].status {
                DownloadStatus::Pending => {
                    state.items.remove(index);
                }
                DownloadStatus::Downloading => {
                    if let Some(token) = state.tokens.remove(item_id) {
                        token.cancel();
                    }
                    let item = &mut state.items[index];
                    item.status = DownloadStatus::Failed;
                    item.error = Some(EngineError::Cancelled.to_string());
                    item.completed_at = Some(Utc::now());
                }
                DownloadStatus::Completed | DownloadStatus::Failed => return Ok(()),
            }
        }

        self.emit_progress();
        self.announce_completed_batches();
        Ok(())
    }

    /// Queue a failed item again with a fresh retry budget
    pub fn retry(&self, item_id: &str) -> Result<()> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let item = state
                .items
                .iter_mut()
                .find(|i| i.id == item_id)
                .ok_or_else(|| EngineError::DownloadNotFound(item_id.to_string()))?;

            if item.status != DownloadStatus::Failed {
                return Err(EngineError::download(format!(
                    "item {} is {:?}, only failed items can be retried",
                    item_id, item.status
                )));
            }
            reset_for_retry(item);
            if let Some(batch_id) = item.batch_id.clone() {
                state.announced.remove(&batch_id);
            }
        }

        self.emit_progress();
        Ok(())
    }

    /// Queue every failed item again. Returns how many were reset.
    pub fn retry_failed(&self) -> usize {
        let count = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut count = 0;
            for item in state
                .items
                .iter_mut()
                .filter(|i| i.status == DownloadStatus::Failed)
            {
                reset_for_retry(item);
                if let Some(batch_id) = &item.batch_id {
                    state.announced.remove(batch_id);
                }
                count += 1;
            }
            count
        };

        if count > 0 {
            log::info!("Retrying {} failed downloads", count);
            self.emit_progress();
        }
        count
    }

    /// Remove an item, aborting its transfer if one is running
    pub fn remove(&self, item_id: &str) -> Result<DownloadItem> {
        let item = {
            let mut state = self.state.lock();
            let index = state
                .items
                .iter()
                .position(|i| i.id == item_id)
                .ok_or_else(|| EngineError::DownloadNotFound(item_id.to_string()))?;
            if let Some(token) = state.tokens.remove(item_id) {
                token.cancel();
            }
            let item = state.items.remove(index);
            state.prune_announced();
            item
        };

        self.emit_progress();
        Ok(item)
    }

    /// Drop completed and failed items. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let before = state.items.len();
            state.items.retain(|i| !i.status.is_settled());
            state.prune_announced();
            before - state.items.len()
        };
        if removed > 0 {
            self.emit_progress();
        }
        removed
    }

    pub fn items(&self) -> Vec<DownloadItem> {
        self.state.lock().items.clone()
    }

    pub fn item(&self, item_id: &str) -> Option<DownloadItem> {
        self.state
            .lock()
            .items
            .iter()
            .find(|i| i.id == item_id)
            .cloned()
    }

    /// Global, per-batch and per-execution counters
    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress::compute(&self.state.lock().items)
    }

    pub fn batch_progress(&self, batch_id: &str) -> Option<ProgressCounts> {
        let state = self.state.lock();
        let counts = ProgressCounts::from_items(
            state
                .items
                .iter()
                .filter(|i| i.batch_id.as_deref() == Some(batch_id)),
        );
        (counts.total > 0).then_some(counts)
    }

    fn chunk_size(&self) -> usize {
        let size = self.config.chunk_size.max(1);
        match &self.monitor {
            Some(monitor) => monitor.allowed_workers(size),
            None => size,
        }
    }

    fn has_pending(&self) -> bool {
        self.state
            .lock()
            .items
            .iter()
            .any(|i| i.status == DownloadStatus::Pending)
    }

    /// Mark up to `limit` pending items downloading and pick their destinations
    fn claim_pending(&self, limit: usize) -> Vec<Claim> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = Utc::now();
        let mut claims = Vec::new();

        for item in state
            .items
            .iter_mut()
            .filter(|i| i.status == DownloadStatus::Pending)
            .take(limit)
        {
            let dir = self.destination_dir(item);
            let reserved = &state.reserved;
            let dest = unique_destination(&dir, &item.filename, |p| {
                p.exists() || reserved.contains(p)
            });
            state.reserved.insert(dest.clone());

            let token = CancellationToken::new();
            state.tokens.insert(item.id.clone(), token.clone());

            item.status = DownloadStatus::Downloading;
            item.started_at = Some(now);
            item.error = None;

            claims.push(Claim {
                id: item.id.clone(),
                url: item.url.clone(),
                dest,
                max_retries: item.max_retries,
                token,
            });
        }

        claims
    }

    fn destination_dir(&self, item: &DownloadItem) -> PathBuf {
        if !self.config.group_into_folders {
            return self.config.download_dir.clone();
        }
        self.config
            .download_dir
            .join(item.execution_id.as_deref().unwrap_or(UNGROUPED_DIR))
            .join(item.batch_id.as_deref().unwrap_or(UNGROUPED_DIR))
    }

    /// Run one claimed item to a settled state, retrying with a delay
    async fn transfer(&self, claim: Claim) {
        emit(
            self.events.as_ref(),
            EngineEvent::DownloadStarted {
                item_id: claim.id.clone(),
                url: claim.url.clone(),
            },
        );
        self.emit_progress();

        let _connection = self.monitor.as_ref().map(|m| m.connection());
        let policy = RetryPolicy::fixed(claim.max_retries, self.config.retry_delay());

        loop {
            let result = self.fetch_once(&claim).await;

            match result {
                Ok(bytes) => {
                    self.settle_completed(&claim, bytes);
                    break;
                }
                Err(e) if e.is_cancelled() || claim.token.is_cancelled() => {
                    self.settle_cancelled(&claim);
                    break;
                }
                Err(e) => {
                    let Some(failures) = self.record_failure(&claim.id, &e) else {
                        // Removed or cancelled while transferring
                        break;
                    };
                    match policy.decide(failures) {
                        RetryDecision::GiveUp => {
                            self.settle_failed(&claim, failures, e.to_string());
                            break;
                        }
                        RetryDecision::RetryAfter(delay) => {
                            log::info!(
                                "Download {} failed (attempt {} of {}), retrying in {}ms: {}",
                                claim.id,
                                failures,
                                claim.max_retries,
                                delay.as_millis(),
                                e
                            );
                            tokio::select! {
                                _ = claim.token.cancelled() => {
                                    self.settle_cancelled(&claim);
                                    break;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.reserved.remove(&claim.dest);
            state.tokens.remove(&claim.id);
        }
        self.emit_progress();
        self.announce_completed_batches();
    }

    async fn fetch_once(&self, claim: &Claim) -> Result<u64> {
        if let Some(parent) = claim.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::select! {
            _ = claim.token.cancelled() => Err(EngineError::Cancelled),
            result = self.fetcher.fetch(&claim.url, &claim.dest, claim.token.clone()) => result,
        }
    }

    /// Count a failed attempt; `None` if the item is no longer transferring
    fn record_failure(&self, item_id: &str, error: &EngineError) -> Option<u32> {
        let mut state = self.state.lock();
        let item = state
            .items
            .iter_mut()
            .find(|i| i.id == item_id && i.status == DownloadStatus::Downloading)?;
        item.retry_count += 1;
        item.error = Some(error.to_string());
        Some(item.retry_count)
    }

    fn settle_completed(&self, claim: &Claim, bytes: u64) {
        let settled = {
            let mut state = self.state.lock();
            match state
                .items
                .iter_mut()
                .find(|i| i.id == claim.id && i.status == DownloadStatus::Downloading)
            {
                Some(item) => {
                    item.status = DownloadStatus::Completed;
                    item.path = Some(claim.dest.clone());
                    item.error = None;
                    item.completed_at = Some(Utc::now());
                    true
                }
                None => false,
            }
        };

        if settled {
            log::info!("Downloaded {} ({} bytes) to {:?}", claim.id, bytes, claim.dest);
            emit(
                self.events.as_ref(),
                EngineEvent::DownloadCompleted {
                    item_id: claim.id.clone(),
                    path: claim.dest.to_string_lossy().into_owned(),
                },
            );
        }
    }

    fn settle_failed(&self, claim: &Claim, retry_count: u32, error: String) {
        {
            let mut state = self.state.lock();
            if let Some(item) = state
                .items
                .iter_mut()
                .find(|i| i.id == claim.id && i.status == DownloadStatus::Downloading)
            {
                item.status = DownloadStatus::Failed;
                item.error = Some(error.clone());
                item.completed_at = Some(Utc::now());
            }
        }

        log::warn!(
            "Download {} failed after {} attempts: {}",
            claim.id,
            retry_count,
            error
        );
        emit(
            self.events.as_ref(),
            EngineEvent::DownloadFailed {
                item_id: claim.id.clone(),
                retry_count,
                error,
            },
        );
    }

    fn settle_cancelled(&self, claim: &Claim) {
        let mut state = self.state.lock();
        if let Some(item) = state
            .items
            .iter_mut()
            .find(|i| i.id == claim.id && i.status == DownloadStatus::Downloading)
        {
            item.status = DownloadStatus::Failed;
            item.error = Some(EngineError::Cancelled.to_string());
            item.completed_at = Some(Utc::now());
        }
    }

    /// Fire the one-time completion event for every batch that just settled
    fn announce_completed_batches(&self) {
        let settled: Vec<(String, ProgressCounts)> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let progress = DownloadProgress::compute(&state.items);
            let mut settled = Vec::new();
            for group in progress.batches {
                if group.counts.is_settled() && !state.announced.contains(&group.id) {
                    state.announced.insert(group.id.clone());
                    settled.push((group.id, group.counts));
                }
            }
            settled
        };

        for (batch_id, counts) in settled {
            log::info!(
                "Download batch {} complete: {} downloaded, {} failed",
                batch_id,
                counts.completed,
                counts.failed
            );
            emit(
                self.events.as_ref(),
                EngineEvent::DownloadBatchCompleted {
                    batch_id: batch_id.clone(),
                    completed: counts.completed,
                    failed: counts.failed,
                },
            );

            if self.config.notify_on_complete {
                if let Some(notifier) = &self.notifier {
                    notifier.notify(
                        "Downloads complete",
                        &format!("{} of {} files downloaded", counts.completed, counts.total),
                    );
                }
            }
        }
    }

    fn emit_progress(&self) {
        emit(
            self.events.as_ref(),
            EngineEvent::DownloadProgress {
                progress: self.progress(),
            },
        );
    }
}

fn reset_for_retry(item: &mut DownloadItem) {
    item.status = DownloadStatus::Pending;
    item.retry_count = 0;
    item.error = None;
    item.path = None;
    item.started_at = None;
    item.completed_at = None;
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::download::types::NamingPolicy;
    use crate::events::RecordingEventSink;

    /// Writes the URL as file content; fails URLs a scripted number of times
    #[derive(Default)]
    struct FakeFetcher {
        failures: Mutex<HashMap<String, u32>>,
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        hang: bool,
    }

    impl FakeFetcher {
        fn failing(url: &str, times: u32) -> Self {
            let fetcher = Self::default();
            fetcher.failures.lock().insert(url.to_string(), times);
            fetcher
        }

        fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ArtifactFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, dest: &Path, cancel: CancellationToken) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);

            if self.hang {
                cancel.cancelled().await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::Cancelled);
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let fail = {
                let mut failures = self.failures.lock();
                match failures.get_mut(url) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if fail {
                return Err(EngineError::download("connection reset"));
            }

            tokio::fs::write(dest, url.as_bytes()).await?;
            Ok(url.len() as u64)
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        count: AtomicUsize,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, _title: &str, _body: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(dir: &Path) -> DownloadConfig {
        DownloadConfig {
            download_dir: dir.to_path_buf(),
            chunk_size: 2,
            retry_delay_ms: 5,
            sequential_delay_ms: 5,
            ..DownloadConfig::default()
        }
    }

    #[test]
    fn test_enqueue_derives_filename() {
        let temp_dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(Arc::new(FakeFetcher::default()), config(temp_dir.path()));

        let id = manager
            .enqueue("https://cdn.test/v/render?sig=1", None, None, None)
            .unwrap();
        assert_eq!(manager.item(&id).unwrap().filename, "render.mp4");

        let id = manager
            .enqueue("https://cdn.test/v/x.webm", Some("hero shot".into()), None, None)
            .unwrap();
        assert_eq!(manager.item(&id).unwrap().filename, "hero shot.webm");

        assert!(manager.enqueue("  ", None, None, None).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_chunks_respect_chunk_size() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let sink = Arc::new(RecordingEventSink::new());
        let manager = DownloadManager::new(fetcher.clone(), config(temp_dir.path()))
            .with_event_sink(sink.clone());

        for n in 0..5 {
            manager
                .enqueue(format!("https://cdn.test/clip{}.mp4", n), None, None, None)
                .unwrap();
        }
        let progress = manager.process().await;

        assert_eq!(progress.overall.completed, 5);
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
        assert!(temp_dir.path().join("clip3.mp4").exists());

        // Every observed snapshot accounts for every item
        for event in sink.events() {
            if let EngineEvent::DownloadProgress { progress } = event {
                let o = progress.overall;
                assert_eq!(o.pending + o.downloading + o.completed + o.failed, o.total);
            }
        }
    }

    #[tokio::test]
    async fn test_sequential_mode_runs_one_at_a_time() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let mut cfg = config(temp_dir.path());
        cfg.mode = DownloadMode::Sequential;
        let manager = DownloadManager::new(fetcher.clone(), cfg);

        for n in 0..3 {
            manager
                .enqueue(format!("https://cdn.test/s{}.mp4", n), None, None, None)
                .unwrap();
        }
        let progress = manager.process().await;
        assert_eq!(progress.overall.completed, 3);
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let temp_dir = TempDir::new().unwrap();
        let url = "https://cdn.test/flaky.mp4";
        let fetcher = Arc::new(FakeFetcher::failing(url, 2));
        let manager = DownloadManager::new(fetcher.clone(), config(temp_dir.path()));

        let id = manager.enqueue(url, None, None, None).unwrap();
        manager.process().await;

        let item = manager.item(&id).unwrap();
        assert_eq!(item.status, DownloadStatus::Completed);
        assert_eq!(item.retry_count, 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(item.path, Some(temp_dir.path().join("flaky.mp4")));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_then_manual_retry() {
        let temp_dir = TempDir::new().unwrap();
        let url = "https://cdn.test/broken.mp4";
        let fetcher = Arc::new(FakeFetcher::failing(url, 3));
        let sink = Arc::new(RecordingEventSink::new());
        let manager = DownloadManager::new(fetcher.clone(), config(temp_dir.path()))
            .with_event_sink(sink.clone());

        let id = manager.enqueue(url, None, None, None).unwrap();
        manager.process().await;

        let item = manager.item(&id).unwrap();
        assert_eq!(item.status, DownloadStatus::Failed);
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.error.as_deref(), Some("Download failed: connection reset"));
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::DownloadFailed { retry_count: 3, .. })));

        assert!(manager.retry("missing").is_err());
        manager.retry(&id).unwrap();
        manager.process().await;
        assert_eq!(manager.item(&id).unwrap().status, DownloadStatus::Completed);
        assert!(manager.retry(&id).is_err());
    }

    #[tokio::test]
    async fn test_batch_naming_grouping_and_single_completion() {
        let temp_dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingEventSink::new());
        let notifier = Arc::new(CountingNotifier::default());
        let mut cfg = config(temp_dir.path());
        cfg.group_into_folders = true;
        let manager = DownloadManager::new(Arc::new(FakeFetcher::default()), cfg)
            .with_event_sink(sink.clone())
            .with_notifier(notifier.clone());

        let batch_id = manager
            .enqueue_batch(
                vec![
                    DownloadRequest::new("https://cdn.test/a.mp4"),
                    DownloadRequest::new("https://cdn.test/b.mp4"),
                ],
                Grouping {
                    execution_id: Some("exec-1".into()),
                    batch_id: Some("batch-1".into()),
                    naming: NamingPolicy::Sequential,
                },
            )
            .unwrap();
        assert_eq!(batch_id, "batch-1");

        manager.process().await;
        manager.process().await;

        let items = manager.items();
        assert_eq!(items[0].filename, "001_a.mp4");
        assert_eq!(
            items[1].path,
            Some(temp_dir.path().join("exec-1").join("batch-1").join("002_b.mp4"))
        );

        let completions = sink
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::DownloadBatchCompleted { .. }))
            .count();
        assert_eq!(completions, 1);
        assert_eq!(notifier.count.load(Ordering::SeqCst), 1);

        let counts = manager.batch_progress("batch-1").unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(manager.progress().execution("exec-1").unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_existing_file_gets_counter_suffix() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("clip.mp4"), b"old").unwrap();
        let manager = DownloadManager::new(Arc::new(FakeFetcher::default()), config(temp_dir.path()));

        let first = manager.enqueue("https://cdn.test/clip.mp4", None, None, None).unwrap();
        let second = manager.enqueue("https://cdn.test/x/clip.mp4", None, None, None).unwrap();
        manager.process().await;

        assert_eq!(
            manager.item(&first).unwrap().path,
            Some(temp_dir.path().join("clip (1).mp4"))
        );
        assert_eq!(
            manager.item(&second).unwrap().path,
            Some(temp_dir.path().join("clip (2).mp4"))
        );
    }

    #[tokio::test]
    async fn test_cancel_fails_in_flight_and_drops_queued() {
        let temp_dir = TempDir::new().unwrap();
        let mut cfg = config(temp_dir.path());
        cfg.chunk_size = 1;
        let manager = Arc::new(DownloadManager::new(Arc::new(FakeFetcher::hanging()), cfg));

        let first = manager.enqueue("https://cdn.test/a.mp4", None, None, None).unwrap();
        manager.enqueue("https://cdn.test/b.mp4", None, None, None).unwrap();

        let worker = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.process().await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.item(&first).map(|i| i.status) != Some(DownloadStatus::Downloading) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(manager.cancel(), 2);
        let progress = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(progress.overall.total, 1);
        assert_eq!(progress.overall.failed, 1);
        let item = manager.item(&first).unwrap();
        assert_eq!(item.error.as_deref(), Some("Cancelled by user"));
    }

    #[tokio::test]
    async fn test_remove_and_clear_finished() {
        let temp_dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(Arc::new(FakeFetcher::default()), config(temp_dir.path()));

        let keep = manager.enqueue("https://cdn.test/a.mp4", None, None, None).unwrap();
        let drop_me = manager.enqueue("https://cdn.test/b.mp4", None, None, None).unwrap();
        manager.remove(&drop_me).unwrap();
        assert!(manager.remove(&drop_me).is_err());

        manager.process().await;
        assert_eq!(manager.item(&keep).unwrap().status, DownloadStatus::Completed);
        assert_eq!(manager.clear_finished(), 1);
        assert!(manager.items().is_empty());
    }

    #[tokio::test]
    async fn test_clearing_a_batch_forgets_its_announcement() {
        let temp_dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(Arc::new(FakeFetcher::default()), config(temp_dir.path()));

        let batch_id = manager
            .enqueue_batch(
                vec![DownloadRequest::new("https://cdn.test/a.mp4")],
                Grouping::default(),
            )
            .unwrap();
        manager.process().await;
        assert!(manager.state.lock().announced.contains(&batch_id));

        assert_eq!(manager.clear_finished(), 1);
        assert!(manager.state.lock().announced.is_empty());
    }

    #[tokio::test]
    async fn test_long_url_segment_downloads_under_capped_name() {
        let temp_dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(Arc::new(FakeFetcher::default()), config(temp_dir.path()));

        let url = format!("https://cdn.test/{}.mp4", "a".repeat(300));
        let id = manager.enqueue(url, None, None, None).unwrap();
        manager.process().await;

        let item = manager.item(&id).unwrap();
        assert_eq!(item.status, DownloadStatus::Completed);
        assert!(item.filename.len() <= 255);
        assert!(item.filename.ends_with(".mp4"));
        assert!(temp_dir.path().join(&item.filename).exists());
    }
}
