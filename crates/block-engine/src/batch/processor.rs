//! Batch job queue.
//!
//! [`BatchProcessor::start`] validates the input synchronously, builds one
//! [`Job`] per item and spawns a dispatcher task. The dispatcher claims
//! eligible jobs while a worker slot is free, the resource monitor admits
//! more work and the rate limiter allows another request; each claimed job
//! runs on its own task with a child cancellation token.
//!
//! All job state lives in one [`BatchRun`] owned by the processor. Workers
//! report outcomes back through the processor, which recomputes counters
//! from the job list, persists a snapshot and emits events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::consistency::apply_preamble;
use super::prompt_file::{load_prompt_file, select_prompts, ParsedPrompts};
use super::types::{
    BatchProgress, BatchRequest, BatchRun, BatchSource, BatchStatus, GenerationRequest, Job,
    JobSource, JobStatus, ReferenceArtifact,
};
use crate::config::{BatchConfig, EngineConfig, PromptFileOptions};
use crate::constants::storage::CURRENT_BATCH_KEY;
use crate::error::{EngineError, Result};
use crate::events::{emit, EngineEvent, EventSink, NullEventSink};
use crate::graph::DependencyGraph;
use crate::scheduling::{
    item_complexity, CompletionPredictor, PredictionInput, RateLimiter, ResourceMonitor,
    RetryDecision, RetryPolicy, RunSample,
};
use crate::store::{load_versioned, save_versioned, KvStore};
use crate::types::Artifact;

/// Produces artifacts for jobs.
///
/// Implemented by the host around its provider clients. The engine never
/// inspects the prompt beyond passing it through.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Run one generation attempt.
    ///
    /// # Arguments
    /// * `request` - Prompt, upstream content and model settings for the job
    /// * `cancel` - Fires when the batch is stopped; long calls should watch it
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<Artifact>;
}

#[derive(Default)]
struct QueueState {
    run: Option<BatchRun>,
    /// Parent of every in-flight job token of the current run
    run_token: Option<CancellationToken>,
    dispatcher: Option<JoinHandle<()>>,
    in_flight: HashMap<String, CancellationToken>,
}

enum Step {
    Dispatch {
        request: GenerationRequest,
        token: CancellationToken,
        permit: OwnedSemaphorePermit,
    },
    Wait(Option<Duration>),
    Finish,
    Exit,
}

/// Queue that turns a batch request into generation jobs and runs them.
///
/// Share it as `Arc<BatchProcessor>`; commands that spawn the dispatcher
/// take `self: &Arc<Self>`.
pub struct BatchProcessor {
    config: BatchConfig,
    prompt_options: PromptFileOptions,
    generator: Arc<dyn Generator>,
    events: Arc<dyn EventSink>,
    store: Option<Arc<dyn KvStore>>,
    graph: Option<Arc<DependencyGraph>>,
    rate_limiter: Arc<RateLimiter>,
    monitor: Option<Arc<ResourceMonitor>>,
    predictor: Arc<CompletionPredictor>,
    slots: Arc<Semaphore>,
    state: Mutex<QueueState>,
    wake: Notify,
}

impl BatchProcessor {
    /// Create a processor with no rate limit, no resource monitor and no persistence
    pub fn new(generator: Arc<dyn Generator>, config: BatchConfig) -> Self {
        let workers = config.workers.max(1);
        Self {
            config,
            prompt_options: PromptFileOptions::default(),
            generator,
            events: Arc::new(NullEventSink),
            store: None,
            graph: None,
            rate_limiter: Arc::new(RateLimiter::unlimited()),
            monitor: None,
            predictor: Arc::new(CompletionPredictor::new()),
            slots: Arc::new(Semaphore::new(workers)),
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
        }
    }

    /// Create a processor with the rate limit, resource thresholds and
    /// prompt limits from `config`
    pub fn from_config(generator: Arc<dyn Generator>, config: &EngineConfig) -> Self {
        Self::new(generator, config.batch.clone())
            .with_prompt_options(config.prompt_file.clone())
            .with_rate_limiter(Arc::new(RateLimiter::new(config.rate_limit.clone())))
            .with_resource_monitor(Arc::new(ResourceMonitor::new(config.resources.clone())))
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Read upstream content from `graph` and record job outputs into it
    pub fn with_graph(mut self, graph: Arc<DependencyGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_resource_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_predictor(mut self, predictor: Arc<CompletionPredictor>) -> Self {
        self.predictor = predictor;
        self
    }

    pub fn with_prompt_options(mut self, options: PromptFileOptions) -> Self {
        self.prompt_options = options;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn predictor(&self) -> &Arc<CompletionPredictor> {
        &self.predictor
    }

    /// Build a batch run and start dispatching it.
    ///
    /// Returns once the run exists; it does not wait for any job. Rejects the
    /// request without creating a run when no valid item remains.
    pub async fn start(self: &Arc<Self>, request: BatchRequest) -> Result<BatchProgress> {
        if self.is_active() {
            return Err(EngineError::BatchAlreadyRunning);
        }

        let (jobs, warnings) = self.build_jobs(&request).await?;
        let mut run = BatchRun::new(jobs, warnings, request.model_settings.clone());
        run.reference = request.reference.clone();

        let batch_id = run.id.clone();
        let total = run.total();
        let run_token = CancellationToken::new();

        let progress = {
            let mut state = self.state.lock();
            if state
                .run
                .as_ref()
                .is_some_and(|r| !r.status.is_finished())
            {
                return Err(EngineError::BatchAlreadyRunning);
            }

            for warning in &run.warnings {
                log::warn!("Batch {}: {}", batch_id, warning);
            }
            log::info!("Starting batch {} with {} jobs", batch_id, total);

            self.persist(&run);
            let progress = self.progress_of(&run);
            state.run = Some(run);
            state.run_token = Some(run_token.clone());
            state.in_flight.clear();
            progress
        };

        emit(
            self.events.as_ref(),
            EngineEvent::BatchStarted {
                batch_id: batch_id.clone(),
                total,
            },
        );
        emit(
            self.events.as_ref(),
            EngineEvent::BatchProgress {
                progress: progress.clone(),
            },
        );

        self.spawn_dispatcher(batch_id, run_token);
        Ok(progress)
    }

    /// Stop dispatching new jobs; in-flight jobs run to completion
    pub fn pause(&self) -> Result<BatchProgress> {
        let progress = {
            let mut state = self.state.lock();
            let run = state
                .run
                .as_mut()
                .filter(|r| r.status == BatchStatus::Processing)
                .ok_or(EngineError::NoActiveBatch)?;

            run.status = BatchStatus::Paused;
            log::info!("Batch {} paused", run.id);
            self.persist(run);
            self.progress_of(run)
        };

        self.wake.notify_one();
        self.emit_progress(&progress);
        Ok(progress)
    }

    /// Continue dispatching a paused run
    pub fn resume(self: &Arc<Self>) -> Result<BatchProgress> {
        let (progress, restart) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let run = state
                .run
                .as_mut()
                .filter(|r| r.status == BatchStatus::Paused)
                .ok_or(EngineError::NoActiveBatch)?;

            run.status = BatchStatus::Processing;
            log::info!("Batch {} resumed", run.id);
            self.persist(run);
            let progress = self.progress_of(run);

            let dispatcher_gone = state
                .dispatcher
                .as_ref()
                .map_or(true, |handle| handle.is_finished());
            let restart = if dispatcher_gone || state.run_token.is_none() {
                let token = CancellationToken::new();
                state.run_token = Some(token.clone());
                Some((run.id.clone(), token))
            } else {
                None
            };
            (progress, restart)
        };

        match restart {
            Some((batch_id, token)) => self.spawn_dispatcher(batch_id, token),
            None => self.wake.notify_one(),
        }
        self.emit_progress(&progress);
        Ok(progress)
    }

    /// Cancel in-flight jobs and discard queued ones.
    ///
    /// In-flight jobs end `failed` with a cancellation reason; never-started
    /// jobs are removed from the run.
    pub fn stop(&self) -> Result<BatchProgress> {
        let mut events = Vec::new();
        let progress = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let run = state
                .run
                .as_mut()
                .filter(|r| !r.status.is_finished())
                .ok_or(EngineError::NoActiveBatch)?;

            if let Some(token) = state.run_token.take() {
                token.cancel();
            }
            for (_, token) in state.in_flight.drain() {
                token.cancel();
            }

            let now = Utc::now();
            let discarded = run.pending();
            run.jobs.retain(|j| j.status != JobStatus::Pending);

            let reason = EngineError::Cancelled.to_string();
            for job in run
                .jobs
                .iter_mut()
                .filter(|j| j.status == JobStatus::Generating)
            {
                job.status = JobStatus::Failed;
                job.error = Some(reason.clone());
                job.completed_at = Some(now);
                events.push(EngineEvent::JobFailed {
                    batch_id: run.id.clone(),
                    job_id: job.id.clone(),
                    retry_count: job.retry_count,
                    error: reason.clone(),
                });
            }

            run.status = BatchStatus::Stopped;
            run.completed_at = Some(now);
            log::info!("Batch {} stopped, {} queued jobs discarded", run.id, discarded);
            self.persist(run);

            let progress = self.progress_of(run);
            events.push(EngineEvent::BatchProgress {
                progress: progress.clone(),
            });
            events.push(EngineEvent::BatchFinished {
                batch_id: run.id.clone(),
                status: run.status,
                completed: progress.completed,
                failed: progress.failed,
            });
            progress
        };

        self.wake.notify_one();
        for event in events {
            emit(self.events.as_ref(), event);
        }
        Ok(progress)
    }

    /// Put every failed job back in the queue with a fresh retry budget.
    ///
    /// A finished run goes back to processing. Returns how many jobs were reset.
    pub fn retry_failed(self: &Arc<Self>) -> Result<usize> {
        let (count, progress, restart) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let run = state.run.as_mut().ok_or(EngineError::NoActiveBatch)?;

            let mut count = 0;
            for job in run
                .jobs
                .iter_mut()
                .filter(|j| j.status == JobStatus::Failed)
            {
                job.status = JobStatus::Pending;
                job.retry_count = 0;
                job.progress = 0;
                job.error = None;
                job.retry_at = None;
                job.started_at = None;
                job.completed_at = None;
                count += 1;
            }
            if count == 0 {
                return Ok(0);
            }

            let mut restart = None;
            if run.status.is_finished() {
                run.status = BatchStatus::Processing;
                run.completed_at = None;
                let token = CancellationToken::new();
                state.run_token = Some(token.clone());
                restart = Some((run.id.clone(), token));
            }

            log::info!("Retrying {} failed jobs in batch {}", count, run.id);
            self.persist(run);
            (count, self.progress_of(run), restart)
        };

        match restart {
            Some((batch_id, token)) => self.spawn_dispatcher(batch_id, token),
            None => self.wake.notify_one(),
        }
        self.emit_progress(&progress);
        Ok(count)
    }

    /// Load the persisted run, if any.
    ///
    /// Jobs a previous process left generating go back to pending and a run
    /// that was processing comes back paused; call [`resume`](Self::resume)
    /// to continue it.
    pub fn restore(&self) -> Result<Option<BatchProgress>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(mut run) = load_versioned::<BatchRun>(store.as_ref(), CURRENT_BATCH_KEY)? else {
            return Ok(None);
        };

        let mut state = self.state.lock();
        if state
            .run
            .as_ref()
            .is_some_and(|r| !r.status.is_finished())
        {
            return Err(EngineError::BatchAlreadyRunning);
        }

        for job in run
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Generating)
        {
            job.status = JobStatus::Pending;
            job.started_at = None;
        }
        if run.status == BatchStatus::Processing {
            run.status = BatchStatus::Paused;
        }

        log::info!(
            "Restored batch {} ({} of {} jobs finished)",
            run.id,
            run.completed() + run.failed(),
            run.total()
        );
        self.persist(&run);
        let progress = self.progress_of(&run);
        state.run = Some(run);
        state.run_token = None;
        state.in_flight.clear();
        Ok(Some(progress))
    }

    /// Forget a finished run and its snapshot
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .run
            .as_ref()
            .is_some_and(|r| !r.status.is_finished())
        {
            return Err(EngineError::BatchAlreadyRunning);
        }
        state.run = None;
        if let Some(store) = &self.store {
            store.remove(CURRENT_BATCH_KEY)?;
        }
        Ok(())
    }

    /// Copy of the current run
    pub fn snapshot(&self) -> Option<BatchRun> {
        self.state.lock().run.clone()
    }

    /// Counters of the current run, with a predicted time to completion
    pub fn progress(&self) -> Option<BatchProgress> {
        let state = self.state.lock();
        state.run.as_ref().map(|run| self.progress_of(run))
    }

    /// A run exists and is processing or paused
    pub fn is_active(&self) -> bool {
        self.state
            .lock()
            .run
            .as_ref()
            .is_some_and(|r| !r.status.is_finished())
    }

    async fn build_jobs(&self, request: &BatchRequest) -> Result<(Vec<Job>, Vec<String>)> {
        let reference = request.reference.as_ref();

        match &request.source {
            BatchSource::Blocks { blocks } => {
                if blocks.is_empty() {
                    return Err(EngineError::invalid_batch("no blocks selected"));
                }

                let mut jobs = Vec::new();
                let mut warnings = Vec::new();
                let mut seen = HashSet::new();
                for (index, block) in blocks.iter().enumerate() {
                    // One job per block so its output is never written twice at once
                    if !seen.insert(block.id.as_str()) {
                        warnings.push(format!(
                            "Block {} was selected more than once; extra selections were ignored",
                            block.number
                        ));
                        continue;
                    }
                    let prompt = override_or(&request.prompt_overrides, index, &block.content);
                    if prompt.is_empty() {
                        warnings.push(format!("Block {} has no content and was skipped", block.number));
                        continue;
                    }
                    let source = JobSource::Block {
                        block_id: block.id.clone(),
                        number: block.number.clone(),
                        block_type: block.block_type,
                    };
                    jobs.push(Job::new(
                        source,
                        apply_preamble(prompt, reference),
                        self.config.max_retries,
                    ));
                }

                if jobs.is_empty() {
                    return Err(EngineError::invalid_batch(format!(
                        "none of the {} selected blocks has content",
                        blocks.len()
                    )));
                }
                if jobs.len() > self.prompt_options.max_prompts {
                    return Err(EngineError::invalid_batch(format!(
                        "{} items exceed the batch limit of {}",
                        jobs.len(),
                        self.prompt_options.max_prompts
                    )));
                }
                Ok((jobs, warnings))
            }
            BatchSource::Prompts { prompts } => {
                let parsed = select_prompts(prompts.iter().map(String::as_str), &self.prompt_options)?;
                Ok(self.prompt_jobs(parsed, &request.prompt_overrides, reference))
            }
            BatchSource::File { path } => {
                let parsed = load_prompt_file(path, &self.prompt_options).await?;
                Ok(self.prompt_jobs(parsed, &request.prompt_overrides, reference))
            }
        }
    }

    fn prompt_jobs(
        &self,
        parsed: ParsedPrompts,
        overrides: &HashMap<usize, String>,
        reference: Option<&ReferenceArtifact>,
    ) -> (Vec<Job>, Vec<String>) {
        let jobs = parsed
            .prompts
            .iter()
            .enumerate()
            .map(|(index, prompt)| {
                let prompt = override_or(overrides, index, prompt);
                Job::new(
                    JobSource::PromptIndex { index },
                    apply_preamble(prompt, reference),
                    self.config.max_retries,
                )
            })
            .collect();
        (jobs, parsed.warnings)
    }

    fn spawn_dispatcher(self: &Arc<Self>, batch_id: String, run_token: CancellationToken) {
        let handle = tokio::spawn(self.clone().dispatch(batch_id, run_token));
        self.state.lock().dispatcher = Some(handle);
    }

    async fn dispatch(self: Arc<Self>, batch_id: String, run_token: CancellationToken) {
        log::debug!("Dispatcher started for batch {}", batch_id);

        loop {
            if run_token.is_cancelled() {
                break;
            }

            let allowed = self.allowed_workers();
            let mut events = Vec::new();
            let step = self.next_step(&batch_id, allowed, &mut events);
            for event in events {
                emit(self.events.as_ref(), event);
            }

            match step {
                Step::Dispatch {
                    request,
                    token,
                    permit,
                } => {
                    let processor = self.clone();
                    tokio::spawn(async move {
                        processor.run_job(request, token, permit).await;
                    });
                }
                Step::Wait(timeout) => {
                    let woken = self.wake.notified();
                    match timeout {
                        Some(delay) => tokio::select! {
                            _ = run_token.cancelled() => break,
                            _ = woken => {}
                            _ = tokio::time::sleep(delay) => {}
                        },
                        None => tokio::select! {
                            _ = run_token.cancelled() => break,
                            _ = woken => {}
                        },
                    }
                }
                Step::Finish => {
                    self.finish_run(&batch_id);
                    break;
                }
                Step::Exit => break,
            }
        }

        log::debug!("Dispatcher stopped for batch {}", batch_id);
    }

    fn allowed_workers(&self) -> usize {
        let workers = self.config.workers.max(1);
        match &self.monitor {
            Some(monitor) => {
                let allowed = monitor.allowed_workers(workers);
                if allowed < workers {
                    log::debug!("Resources constrained, admitting {} of {} workers", allowed, workers);
                }
                allowed
            }
            None => workers,
        }
    }

    /// Decide the dispatcher's next move and claim a job if one can run now
    fn next_step(&self, batch_id: &str, allowed: usize, events: &mut Vec<EngineEvent>) -> Step {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(run) = state.run.as_mut().filter(|r| r.id == batch_id) else {
            return Step::Exit;
        };

        match run.status {
            BatchStatus::Completed | BatchStatus::Stopped => return Step::Exit,
            BatchStatus::Paused => return Step::Wait(None),
            BatchStatus::Processing => {}
        }

        if run.is_drained() {
            return Step::Finish;
        }

        if state.in_flight.len() >= allowed {
            let recheck = (allowed < self.config.workers).then(|| self.config.admission_backoff());
            return Step::Wait(recheck);
        }

        let now = Utc::now();
        let Some(index) = run.jobs.iter().position(|j| j.is_eligible(now)) else {
            // Only jobs waiting out a retry delay, or in flight
            let next_retry = run
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Pending)
                .filter_map(|j| j.retry_at)
                .min();
            return Step::Wait(next_retry.map(|at| (at - now).to_std().unwrap_or_default()));
        };

        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            return Step::Wait(None);
        };

        if let Err(wait) = self.rate_limiter.try_acquire_at(Instant::now()) {
            log::debug!("Rate limit reached, next dispatch in {}ms", wait.as_millis());
            return Step::Wait(Some(wait));
        }

        let job = &mut run.jobs[index];
        job.status = JobStatus::Generating;
        job.progress = 0;
        job.started_at = Some(now);
        job.completed_at = None;
        job.retry_at = None;

        let upstream = match (&self.graph, job.source.block_id()) {
            (Some(graph), Some(block_id)) => graph.upstream_of(block_id),
            _ => Vec::new(),
        };
        let request = GenerationRequest {
            batch_id: run.id.clone(),
            job_id: job.id.clone(),
            source: job.source.clone(),
            prompt: job.prompt.clone(),
            model_settings: run.model_settings.clone(),
            reference: run.reference.clone(),
            upstream,
            attempt: job.retry_count,
        };

        let token = state
            .run_token
            .as_ref()
            .map(|t| t.child_token())
            .unwrap_or_else(CancellationToken::new);
        state.in_flight.insert(request.job_id.clone(), token.clone());

        self.persist(run);
        events.push(EngineEvent::JobStarted {
            batch_id: run.id.clone(),
            job_id: request.job_id.clone(),
        });
        events.push(EngineEvent::BatchProgress {
            progress: self.progress_of(run),
        });

        Step::Dispatch {
            request,
            token,
            permit,
        }
    }

    async fn run_job(
        self: Arc<Self>,
        request: GenerationRequest,
        token: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) {
        let connection = self.monitor.as_ref().map(|m| m.connection());
        let batch_id = request.batch_id.clone();
        let job_id = request.job_id.clone();

        let outcome = tokio::select! {
            _ = token.cancelled() => Err(EngineError::Cancelled),
            result = self.generator.generate(request, token.clone()) => result,
        };

        // Free the slot before the dispatcher is woken
        drop(connection);
        drop(permit);

        let events = self.apply_outcome(&batch_id, &job_id, outcome);
        self.wake.notify_one();
        for event in events {
            emit(self.events.as_ref(), event);
        }
    }

    fn apply_outcome(
        &self,
        batch_id: &str,
        job_id: &str,
        outcome: Result<Artifact>,
    ) -> Vec<EngineEvent> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.in_flight.remove(job_id);

        let Some(run) = state.run.as_mut().filter(|r| r.id == batch_id) else {
            return Vec::new();
        };
        let Some(job) = run.job_mut(job_id) else {
            return Vec::new();
        };
        // A stop already settled this job
        if job.status != JobStatus::Generating {
            return Vec::new();
        }

        let now = Utc::now();
        let event = match outcome {
            Ok(artifact) => {
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.completed_at = Some(now);
                job.error = None;
                job.artifact = Some(artifact.clone());

                if let (Some(graph), JobSource::Block { block_id, number, .. }) =
                    (&self.graph, &job.source)
                {
                    graph.record_output(block_id, artifact.value.clone(), artifact.kind, number.clone());
                }

                EngineEvent::JobCompleted {
                    batch_id: batch_id.to_string(),
                    job_id: job_id.to_string(),
                    source_block_id: job.source.block_id().map(str::to_string),
                    artifact,
                }
            }
            Err(e) => {
                let error = e.to_string();
                job.error = Some(error.clone());

                let decision = if e.is_cancelled() {
                    RetryDecision::GiveUp
                } else {
                    job.retry_count += 1;
                    RetryPolicy::fixed(job.max_retries, self.config.retry_delay())
                        .decide(job.retry_count)
                };

                match decision {
                    RetryDecision::GiveUp => {
                        job.status = JobStatus::Failed;
                        job.completed_at = Some(now);
                        log::warn!(
                            "Job {} failed after {} attempts: {}",
                            job_id,
                            job.retry_count,
                            error
                        );
                        EngineEvent::JobFailed {
                            batch_id: batch_id.to_string(),
                            job_id: job_id.to_string(),
                            retry_count: job.retry_count,
                            error,
                        }
                    }
                    RetryDecision::RetryAfter(delay) => {
                        job.status = JobStatus::Pending;
                        job.retry_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
                        log::info!(
                            "Job {} failed (attempt {} of {}), retrying in {}ms: {}",
                            job_id,
                            job.retry_count,
                            job.max_retries,
                            delay.as_millis(),
                            error
                        );
                        EngineEvent::JobRetrying {
                            batch_id: batch_id.to_string(),
                            job_id: job_id.to_string(),
                            retry_count: job.retry_count,
                            error,
                        }
                    }
                }
            }
        };

        self.persist(run);
        vec![
            event,
            EngineEvent::BatchProgress {
                progress: self.progress_of(run),
            },
        ]
    }

    fn finish_run(&self, batch_id: &str) {
        let events = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(run) = state
                .run
                .as_mut()
                .filter(|r| r.id == batch_id && r.status == BatchStatus::Processing && r.is_drained())
            else {
                return;
            };

            let now = Utc::now();
            run.status = BatchStatus::Completed;
            run.completed_at = Some(now);
            state.run_token = None;

            let duration_ms = (now - run.started_at).num_milliseconds().max(0) as u64;
            self.predictor.record_run(RunSample {
                item_count: run.total(),
                workers: self.config.workers,
                duration_ms,
            });

            log::info!(
                "Batch {} completed in {}ms: {} completed, {} failed",
                run.id,
                duration_ms,
                run.completed(),
                run.failed()
            );
            self.persist(run);

            let progress = self.progress_of(run);
            vec![
                EngineEvent::BatchFinished {
                    batch_id: run.id.clone(),
                    status: run.status,
                    completed: progress.completed,
                    failed: progress.failed,
                },
                EngineEvent::BatchProgress { progress },
            ]
        };

        for event in events {
            emit(self.events.as_ref(), event);
        }
    }

    fn progress_of(&self, run: &BatchRun) -> BatchProgress {
        let mut progress = run.progress();
        if !run.status.is_finished() {
            let prediction = self.predictor.predict(&self.prediction_input(run));
            progress.eta_ms = Some(prediction.remaining_ms);
        }
        progress
    }

    fn prediction_input(&self, run: &BatchRun) -> PredictionInput {
        let mut input = PredictionInput {
            total_items: run.total(),
            completed_items: run.completed() + run.failed(),
            workers: self.config.workers,
            elapsed: (Utc::now() - run.started_at).to_std().unwrap_or_default(),
            ..Default::default()
        };

        for job in &run.jobs {
            let complexity = item_complexity(&job.prompt, job.source.block_type());
            match job.status {
                JobStatus::Completed => {
                    if let Some(ms) = job.duration_ms() {
                        input.item_durations_ms.push(ms);
                    }
                    input.completed_complexity += complexity;
                }
                JobStatus::Pending | JobStatus::Generating => {
                    input.remaining_complexity += complexity;
                }
                JobStatus::Failed => {}
            }
        }
        input
    }

    fn persist(&self, run: &BatchRun) {
        if let Some(store) = &self.store {
            if let Err(e) = save_versioned(store.as_ref(), CURRENT_BATCH_KEY, run) {
                log::warn!("Failed to persist batch {}: {}", run.id, e);
            }
        }
    }

    fn emit_progress(&self, progress: &BatchProgress) {
        emit(
            self.events.as_ref(),
            EngineEvent::BatchProgress {
                progress: progress.clone(),
            },
        );
    }
}

/// The override for `index` if it has content, else `original`, trimmed
fn override_or<'a>(overrides: &'a HashMap<usize, String>, index: usize, original: &'a str) -> &'a str {
    overrides
        .get(&index)
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| original.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::store::MemoryKvStore;
    use crate::types::{Block, BlockType, Connection};

    /// Echoes the prompt back as a text artifact
    #[derive(Default)]
    struct EchoGenerator {
        requests: Mutex<Vec<GenerationRequest>>,
    }

    #[async_trait]
    impl Generator for EchoGenerator {
        async fn generate(
            &self,
            request: GenerationRequest,
            _cancel: CancellationToken,
        ) -> Result<Artifact> {
            let artifact = Artifact::text(format!("out: {}", request.prompt));
            self.requests.lock().push(request);
            Ok(artifact)
        }
    }

    /// Fails each prompt a fixed number of times before succeeding
    struct FlakyGenerator {
        failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<u32>,
    }

    impl FlakyGenerator {
        fn new(prompt: &str, failures: u32) -> Self {
            Self {
                failures: Mutex::new(HashMap::from([(prompt.to_string(), failures)])),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Generator for FlakyGenerator {
        async fn generate(
            &self,
            request: GenerationRequest,
            _cancel: CancellationToken,
        ) -> Result<Artifact> {
            *self.calls.lock() += 1;
            let mut failures = self.failures.lock();
            match failures.get_mut(&request.prompt) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(EngineError::generation("provider unavailable"))
                }
                _ => Ok(Artifact::media(BlockType::Video, "https://cdn.test/clip.mp4")),
            }
        }
    }

    /// Blocks each call until a permit is released
    struct GatedGenerator {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Generator for GatedGenerator {
        async fn generate(
            &self,
            _request: GenerationRequest,
            _cancel: CancellationToken,
        ) -> Result<Artifact> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| EngineError::generation("gate closed"))?;
            Ok(Artifact::text("done"))
        }
    }

    fn test_config(workers: usize) -> BatchConfig {
        BatchConfig {
            workers,
            max_retries: 3,
            retry_delay_ms: 10,
            admission_backoff_ms: 10,
        }
    }

    async fn wait_until<F>(processor: &BatchProcessor, check: F)
    where
        F: Fn(&BatchRun) -> bool,
    {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if processor.snapshot().as_ref().is_some_and(&check) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "condition not reached: {:?}", processor.progress());
    }

    fn finished(run: &BatchRun) -> bool {
        run.status.is_finished()
    }

    #[tokio::test]
    async fn test_blank_blocks_skipped_and_run_completes() {
        let sink = Arc::new(RecordingEventSink::new());
        let processor = Arc::new(
            BatchProcessor::new(Arc::new(EchoGenerator::default()), test_config(2))
                .with_event_sink(sink.clone()),
        );

        let blocks = vec![
            Block::text("b1", "A01", "a"),
            Block::text("b2", "A02", "   "),
            Block::text("b3", "A03", "c"),
        ];
        let started = processor.start(BatchRequest::blocks(blocks)).await.unwrap();
        assert_eq!(started.total, 2);

        wait_until(&processor, finished).await;
        let run = processor.snapshot().unwrap();
        assert_eq!(run.status, BatchStatus::Completed);
        assert_eq!(run.completed(), 2);
        assert_eq!(run.failed(), 0);
        assert_eq!(run.pending(), 0);
        assert_eq!(run.warnings.len(), 1);

        let events = sink.events();
        let completed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::JobCompleted { source_block_id, .. } => source_block_id.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(completed.len(), 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::BatchFinished { completed: 2, .. })));
    }

    #[tokio::test]
    async fn test_empty_input_rejected_without_run() {
        let processor = Arc::new(BatchProcessor::new(
            Arc::new(EchoGenerator::default()),
            test_config(1),
        ));
        let err = processor
            .start(BatchRequest::blocks(vec![Block::text("b1", "A01", "")]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidBatch(_)));
        assert!(processor.snapshot().is_none());

        let err = processor
            .start(BatchRequest::blocks(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidBatch(_)));
    }

    #[tokio::test]
    async fn test_success_on_last_allowed_attempt() {
        let generator = Arc::new(FlakyGenerator::new("flaky prompt", 2));
        let processor = Arc::new(BatchProcessor::new(generator.clone(), test_config(1)));

        processor
            .start(BatchRequest::prompts(vec!["flaky prompt".into()]))
            .await
            .unwrap();
        wait_until(&processor, finished).await;

        let run = processor.snapshot().unwrap();
        let job = &run.jobs[0];
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(*generator.calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_failed() {
        let sink = Arc::new(RecordingEventSink::new());
        let generator = Arc::new(FlakyGenerator::new("doomed prompt", 10));
        let processor = Arc::new(
            BatchProcessor::new(generator.clone(), test_config(1)).with_event_sink(sink.clone()),
        );

        processor
            .start(BatchRequest::prompts(vec!["doomed prompt".into()]))
            .await
            .unwrap();
        wait_until(&processor, finished).await;

        let run = processor.snapshot().unwrap();
        assert_eq!(run.status, BatchStatus::Completed);
        assert_eq!(run.jobs[0].status, JobStatus::Failed);
        assert_eq!(run.jobs[0].retry_count, 3);
        assert_eq!(*generator.calls.lock(), 3);

        let retries = sink
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::JobRetrying { .. }))
            .count();
        assert_eq!(retries, 2);

        // A fresh budget lets the job run again
        assert_eq!(processor.retry_failed().unwrap(), 1);
        wait_until(&processor, finished).await;
        assert_eq!(*generator.calls.lock(), 6);
    }

    #[tokio::test]
    async fn test_pause_keeps_queue_and_resume_drains_it() {
        let gate = Arc::new(Semaphore::new(0));
        let processor = Arc::new(BatchProcessor::new(
            Arc::new(GatedGenerator { gate: gate.clone() }),
            test_config(1),
        ));

        processor
            .start(BatchRequest::prompts(vec![
                "first prompt".into(),
                "second prompt".into(),
                "third prompt".into(),
            ]))
            .await
            .unwrap();
        wait_until(&processor, |run| run.generating() == 1).await;

        processor.pause().unwrap();
        gate.add_permits(10);
        wait_until(&processor, |run| run.generating() == 0).await;

        let run = processor.snapshot().unwrap();
        assert_eq!(run.status, BatchStatus::Paused);
        assert_eq!(run.completed(), 1);
        assert_eq!(run.pending(), 2);

        processor.resume().unwrap();
        wait_until(&processor, finished).await;
        assert_eq!(processor.snapshot().unwrap().completed(), 3);
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_and_drops_queued() {
        let gate = Arc::new(Semaphore::new(0));
        let processor = Arc::new(BatchProcessor::new(
            Arc::new(GatedGenerator { gate }),
            test_config(1),
        ));

        processor
            .start(BatchRequest::prompts(vec![
                "first prompt".into(),
                "second prompt".into(),
                "third prompt".into(),
            ]))
            .await
            .unwrap();
        wait_until(&processor, |run| run.generating() == 1).await;

        let progress = processor.stop().unwrap();
        assert_eq!(progress.status, BatchStatus::Stopped);
        assert_eq!(progress.total, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(
            progress.completed + progress.failed + progress.pending + progress.generating,
            progress.total
        );

        let run = processor.snapshot().unwrap();
        assert_eq!(run.jobs[0].error.as_deref(), Some("Cancelled by user"));
        assert!(matches!(processor.stop(), Err(EngineError::NoActiveBatch)));
    }

    #[tokio::test]
    async fn test_second_start_while_running_is_rejected() {
        let gate = Arc::new(Semaphore::new(0));
        let processor = Arc::new(BatchProcessor::new(
            Arc::new(GatedGenerator { gate: gate.clone() }),
            test_config(1),
        ));

        processor
            .start(BatchRequest::prompts(vec!["first prompt".into()]))
            .await
            .unwrap();
        let err = processor
            .start(BatchRequest::prompts(vec!["second prompt".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BatchAlreadyRunning));

        gate.add_permits(1);
        wait_until(&processor, finished).await;
    }

    #[tokio::test]
    async fn test_restore_brings_back_interrupted_run_paused() {
        let store = Arc::new(MemoryKvStore::new());

        let mut run = BatchRun::new(
            vec![
                Job::new(JobSource::PromptIndex { index: 0 }, "first prompt".into(), 3),
                Job::new(JobSource::PromptIndex { index: 1 }, "second prompt".into(), 3),
            ],
            Vec::new(),
            serde_json::Value::Null,
        );
        run.jobs[0].status = JobStatus::Generating;
        save_versioned(store.as_ref(), CURRENT_BATCH_KEY, &run).unwrap();

        let processor = Arc::new(
            BatchProcessor::new(Arc::new(EchoGenerator::default()), test_config(2))
                .with_store(store.clone()),
        );
        let progress = processor.restore().unwrap().unwrap();
        assert_eq!(progress.status, BatchStatus::Paused);
        assert_eq!(progress.pending, 2);

        processor.resume().unwrap();
        wait_until(&processor, finished).await;
        assert_eq!(processor.snapshot().unwrap().completed(), 2);

        // The finished run was persisted
        let saved: BatchRun = load_versioned(store.as_ref(), CURRENT_BATCH_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(saved.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_upstream_content_reaches_generator_and_output_is_recorded() {
        let graph = Arc::new(DependencyGraph::new());
        graph.upsert_edges(vec![Connection::new("e1", "a", "b")]);
        graph.record_output("a", "a lighthouse at night", BlockType::Text, "A01");

        let generator = Arc::new(EchoGenerator::default());
        let processor = Arc::new(
            BatchProcessor::new(generator.clone(), test_config(1)).with_graph(graph.clone()),
        );

        processor
            .start(BatchRequest::blocks(vec![Block::text("b", "A02", "animate it")]))
            .await
            .unwrap();
        wait_until(&processor, finished).await;

        let requests = generator.requests.lock();
        assert_eq!(requests[0].upstream.len(), 1);
        assert_eq!(requests[0].upstream[0].content, "a lighthouse at night");

        let cached = graph.cached_output("b").unwrap();
        assert_eq!(cached.content, "out: animate it");
    }

    #[tokio::test]
    async fn test_reference_adds_preamble_and_overrides_replace_prompts() {
        let generator = Arc::new(EchoGenerator::default());
        let processor = Arc::new(BatchProcessor::new(generator.clone(), test_config(1)));

        let reference = ReferenceArtifact {
            artifact: Artifact::media(BlockType::Image, "https://cdn.test/anchor.png"),
            label: None,
        };
        processor
            .start(
                BatchRequest::prompts(vec!["original prompt".into()])
                    .with_override(0, "replacement prompt")
                    .with_reference(reference),
            )
            .await
            .unwrap();
        wait_until(&processor, finished).await;

        let requests = generator.requests.lock();
        assert!(requests[0].prompt.starts_with("Keep characters"));
        assert!(requests[0].prompt.ends_with("replacement prompt"));
        assert!(requests[0].reference.is_some());
    }

    #[tokio::test]
    async fn test_block_selected_twice_runs_once() {
        let gate = Arc::new(Semaphore::new(0));
        let processor = Arc::new(BatchProcessor::new(
            Arc::new(GatedGenerator { gate: gate.clone() }),
            test_config(3),
        ));

        let block = Block::text("b1", "A01", "a quiet street");
        let started = processor
            .start(BatchRequest::blocks(vec![block.clone(), block]))
            .await
            .unwrap();
        assert_eq!(started.total, 1);

        wait_until(&processor, |run| run.generating() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let run = processor.snapshot().unwrap();
        let in_flight_for_b1 = run
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Generating && j.source.block_id() == Some("b1"))
            .count();
        assert_eq!(in_flight_for_b1, 1);
        assert_eq!(run.warnings.len(), 1);

        gate.add_permits(1);
        wait_until(&processor, finished).await;
        assert_eq!(processor.snapshot().unwrap().completed(), 1);
    }

    #[tokio::test]
    async fn test_blank_override_keeps_original_text() {
        let generator = Arc::new(EchoGenerator::default());
        let processor = Arc::new(BatchProcessor::new(generator.clone(), test_config(1)));

        processor
            .start(
                BatchRequest::blocks(vec![
                    Block::text("b1", "A01", "a red kite"),
                    Block::text("b2", "A02", ""),
                ])
                .with_override(0, "   ")
                .with_override(1, "  "),
            )
            .await
            .unwrap();
        wait_until(&processor, finished).await;
        assert_eq!(generator.requests.lock()[0].prompt, "a red kite");
        assert_eq!(processor.snapshot().unwrap().warnings.len(), 1);

        let generator = Arc::new(EchoGenerator::default());
        let processor = Arc::new(BatchProcessor::new(generator.clone(), test_config(1)));
        processor
            .start(BatchRequest::prompts(vec!["a green lantern".into()]).with_override(0, " "))
            .await
            .unwrap();
        wait_until(&processor, finished).await;
        assert_eq!(generator.requests.lock()[0].prompt, "a green lantern");
    }
}
