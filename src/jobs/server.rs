//! The job server.
//!
//! Owns a bounded queue drained by a single dispatcher task under a
//! concurrency gate, a per-job state machine, persistence at every status
//! transition, event emission, and retry orchestration anchored to the
//! original job id.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::telemetry::Telemetry;

use super::classifier::classify;
use super::error::HandlerError;
use super::events::{EventBus, EventKind, JobEvent};
use super::job::{original_id, Job, JobOptions, JobStatus};
use super::retry::{RetrySummary, RetryTable, RetryVerdict};
use super::store::{JobCounts, JobFilter, JobStore, StoreError};
use super::worker::{JobContext, JobHandler};

const COMPONENT: &str = "jobs";

/// Grace period after the cooperative cancel signal before the job is
/// recorded as timed out.
const CANCEL_GRACE_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct JobServerConfig {
    pub job_type: String,
    pub max_concurrent: usize,
    pub queue_max_size: usize,
    pub default_timeout_ms: u64,
    pub base_retry_delay_ms: u64,
    pub default_max_retries: u32,
    pub drain_timeout_ms: u64,
}

impl Default for JobServerConfig {
    fn default() -> Self {
        Self {
            job_type: "default".to_string(),
            max_concurrent: 3,
            queue_max_size: 1000,
            default_timeout_ms: 600_000,
            base_retry_delay_ms: 5000,
            default_max_retries: 2,
            drain_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobServerError {
    #[error("queue at capacity ({depth} jobs)")]
    QueueFull { depth: usize },
    #[error("duplicate job id: {0}")]
    Duplicate(String),
    #[error("server is stopping")]
    Stopping,
    #[error("job {0} not found")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("queue did not drain within {0}ms")]
    Timeout(u64),
    #[error("event stream closed before the queue drained")]
    Closed,
}

/// Queue entry ordering: higher priority first, then enqueue order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i64,
    seq: u64,
    id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct ServerState {
    jobs: HashMap<String, Job>,
    queue: BinaryHeap<QueueEntry>,
    running: HashSet<String>,
    /// Jobs popped from the queue but not yet marked running.
    dispatching: usize,
    /// Retry timers waiting to enqueue a synthesized retry job.
    pending_retries: usize,
    paused: bool,
    stopping: bool,
    seq: u64,
}

impl ServerState {
    fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.running.is_empty()
            && self.dispatching == 0
            && self.pending_retries == 0
    }
}

struct Inner {
    config: JobServerConfig,
    state: Mutex<ServerState>,
    retries: RetryTable,
    events: EventBus,
    store: Arc<dyn JobStore>,
    telemetry: Arc<dyn Telemetry>,
    handler: Arc<dyn JobHandler>,
    slots: Arc<Semaphore>,
    wake: Notify,
}

pub struct JobServer {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobServer {
    pub fn new(
        config: JobServerConfig,
        handler: Arc<dyn JobHandler>,
        store: Arc<dyn JobStore>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(ServerState::default()),
            retries: RetryTable::new(),
            events: EventBus::default(),
            store,
            telemetry,
            handler,
            slots,
            wake: Notify::new(),
        });

        Inner::recover_queued(&inner);

        let dispatcher = tokio::spawn(Inner::dispatch_loop(inner.clone()));
        Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn config(&self) -> &JobServerConfig {
        &self.inner.config
    }

    pub fn create_job(&self, data: Value) -> Result<String, JobServerError> {
        self.create_job_with(None, data, self.default_options())
    }

    pub fn create_job_with(
        &self,
        id: Option<String>,
        data: Value,
        options: JobOptions,
    ) -> Result<String, JobServerError> {
        Inner::create_internal(&self.inner, id, data, options, false)
    }

    pub fn default_options(&self) -> JobOptions {
        JobOptions {
            max_retries: self.inner.config.default_max_retries,
            ..JobOptions::default()
        }
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.inner.state.lock().expect("state lock poisoned").jobs.get(id).cloned()
    }

    pub fn get_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let state = self.inner.state.lock().expect("state lock poisoned");
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| filter.status.map(|s| job.status == s).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        jobs
    }

    pub fn get_counts(&self) -> JobCounts {
        let state = self.inner.state.lock().expect("state lock poisoned");
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            counts.bump(job.status);
        }
        counts
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().expect("state lock poisoned").queue.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().expect("state lock poisoned").running.len()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().expect("state lock poisoned").is_idle()
    }

    pub fn pause(&self) {
        self.inner.state.lock().expect("state lock poisoned").paused = true;
    }

    pub fn resume(&self) {
        self.inner.state.lock().expect("state lock poisoned").paused = false;
        self.inner.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().expect("state lock poisoned").paused
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn retry_summary(&self) -> RetrySummary {
        self.inner.retries.summary()
    }

    pub fn retry_info(&self, id: &str) -> Option<super::retry::RetryInfo> {
        self.inner.retries.get(&original_id(id))
    }

    /// Resolves when the queue is empty and nothing is running. Listeners
    /// are registered before the idle check so a completion landing between
    /// registration and check cannot be missed.
    pub async fn wait_for_completion(&self, timeout_ms: u64) -> Result<(), WaitError> {
        let mut rx = self.inner.events.subscribe();
        if self.is_idle() {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return Err(WaitError::Timeout(timeout_ms)),
                Ok(Ok(event)) => {
                    let terminal = matches!(
                        event.kind,
                        EventKind::JobCompleted | EventKind::JobFailed | EventKind::QueueDrained
                    );
                    if terminal && self.is_idle() {
                        return Ok(());
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    if self.is_idle() {
                        return Ok(());
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return if self.is_idle() {
                        Ok(())
                    } else {
                        Err(WaitError::Closed)
                    };
                }
            }
        }
    }

    pub async fn drain(&self, timeout_ms: u64) -> bool {
        self.wait_for_completion(timeout_ms).await.is_ok()
    }

    /// Refuses new jobs, waits for running jobs to finish (bounded by the
    /// configured drain timeout), and stops the dispatcher.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            state.stopping = true;
        }
        self.inner.wake.notify_one();

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.inner.config.drain_timeout_ms);
        let mut rx = self.inner.events.subscribe();
        loop {
            let busy = {
                let state = self.inner.state.lock().expect("state lock poisoned");
                !state.running.is_empty() || state.dispatching > 0
            };
            if !busy {
                break;
            }
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    tracing::warn!(
                        "Shutdown drain timed out with {} job(s) still running",
                        self.running_count()
                    );
                    break;
                }
                Ok(_) => {}
            }
        }

        if let Some(handle) = self.dispatcher.lock().expect("dispatcher lock poisoned").take() {
            handle.abort();
        }
    }
}

impl Inner {
    /// Re-enqueues jobs the store still reports as queued. Completed and
    /// failed rows are never re-driven.
    fn recover_queued(inner: &Arc<Inner>) {
        let filter = JobFilter {
            job_type: Some(inner.config.job_type.clone()),
            status: Some(JobStatus::Queued),
            limit: None,
        };
        let recovered: Vec<Job> = match inner.store.load(&filter) {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::warn!("Failed to load persisted queue: {}", err);
                return;
            }
        };
        if recovered.is_empty() {
            return;
        }

        let mut state = inner.state.lock().expect("state lock poisoned");
        let mut count = 0usize;
        for job in recovered {
            if state.jobs.contains_key(&job.id) {
                continue;
            }
            let seq = state.seq;
            state.seq += 1;
            state.queue.push(QueueEntry {
                priority: job.options.priority.unwrap_or(0),
                seq,
                id: job.id.clone(),
            });
            state.jobs.insert(job.id.clone(), job);
            count += 1;
        }
        tracing::info!(
            "Recovered {} queued {} job(s) from the store",
            count,
            inner.config.job_type
        );
    }

    fn create_internal(
        inner: &Arc<Inner>,
        id: Option<String>,
        data: Value,
        options: JobOptions,
        from_retry: bool,
    ) -> Result<String, JobServerError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let queued = {
            let mut state = inner.state.lock().expect("state lock poisoned");
            if from_retry {
                state.pending_retries = state.pending_retries.saturating_sub(1);
            }
            if state.stopping {
                return Err(JobServerError::Stopping);
            }
            if state.queue.len() >= inner.config.queue_max_size {
                return Err(JobServerError::QueueFull {
                    depth: state.queue.len(),
                });
            }
            if state.jobs.contains_key(&id) {
                return Err(JobServerError::Duplicate(id));
            }

            let mut job = Job::new(id.clone(), inner.config.job_type.clone(), data, options);
            let created = job.clone();
            job.status = JobStatus::Queued;

            let seq = state.seq;
            state.seq += 1;
            state.queue.push(QueueEntry {
                priority: job.options.priority.unwrap_or(0),
                seq,
                id: id.clone(),
            });
            state.jobs.insert(id.clone(), job.clone());

            // Emitted under the lock so created/queued ordering across jobs
            // matches enqueue order.
            inner.events.emit(JobEvent::for_job(EventKind::JobCreated, &created));
            inner.events.emit(JobEvent::for_job(EventKind::JobQueued, &job));
            job
        };

        Inner::persist(inner, &queued);
        inner.wake.notify_one();
        Ok(id)
    }

    fn persist(inner: &Arc<Inner>, job: &Job) {
        if let Err(err) = inner.store.save(job) {
            Inner::warn_store(inner, job, &err);
        }
    }

    fn warn_store(inner: &Arc<Inner>, job: &Job, err: &StoreError) {
        tracing::warn!("Failed to persist job {}: {}", job.id, err);
        inner
            .telemetry
            .warning(COMPONENT, &format!("job persistence failed: {err}"));
    }

    async fn dispatch_loop(inner: Arc<Inner>) {
        loop {
            let entry = loop {
                {
                    let mut state = inner.state.lock().expect("state lock poisoned");
                    if state.stopping {
                        return;
                    }
                    if !state.paused {
                        if let Some(entry) = state.queue.pop() {
                            state.dispatching += 1;
                            break entry;
                        }
                    }
                }
                inner.wake.notified().await;
            };

            let permit = match inner.slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let stopping = inner.state.lock().expect("state lock poisoned").stopping;
            if stopping {
                let mut state = inner.state.lock().expect("state lock poisoned");
                state.dispatching = state.dispatching.saturating_sub(1);
                return;
            }

            tokio::spawn(Inner::execute(inner.clone(), entry.id, permit));
        }
    }

    async fn execute(
        inner: Arc<Inner>,
        id: String,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let job = {
            let mut state = inner.state.lock().expect("state lock poisoned");
            state.dispatching = state.dispatching.saturating_sub(1);
            let Some(job) = state.jobs.get_mut(&id) else {
                return;
            };
            if !job.status.can_transition(JobStatus::Running) {
                inner.telemetry.error(
                    COMPONENT,
                    &format!(
                        "illegal transition {} -> running for job {}",
                        job.status.as_str(),
                        job.id
                    ),
                );
                return;
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            let job = job.clone();
            state.running.insert(id.clone());
            job
        };

        Inner::persist(&inner, &job);
        inner
            .events
            .emit(JobEvent::for_job(EventKind::JobStarted, &job));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let progress_inner = inner.clone();
        let progress_id = id.clone();
        let ctx = JobContext::new(
            job.clone(),
            Arc::new(move |pct| Inner::record_progress(&progress_inner, &progress_id, pct)),
            cancel_rx,
        );

        let timeout_ms = job
            .options
            .timeout_ms
            .unwrap_or(inner.config.default_timeout_ms);
        let handler = inner.handler.clone();
        let mut fut = Box::pin(async move {
            match AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(HandlerError::new("job handler panicked")),
            }
        });

        let outcome = match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut fut).await
        {
            Ok(result) => result,
            Err(_) => {
                // Deadline reached: signal cooperative cancellation and give
                // the handler a short grace period.
                let _ = cancel_tx.send(true);
                match tokio::time::timeout(Duration::from_millis(CANCEL_GRACE_MS), &mut fut).await
                {
                    Ok(_) => Err(HandlerError::timed_out(timeout_ms)),
                    Err(_) => {
                        // The handler ignored cancellation. Record the
                        // timeout now, but hold the concurrency slot until
                        // it actually returns.
                        Inner::finish(&inner, &id, Err(HandlerError::timed_out(timeout_ms)));
                        let _ = fut.await;
                        drop(permit);
                        inner.wake.notify_one();
                        return;
                    }
                }
            }
        };

        Inner::finish(&inner, &id, outcome);
        drop(permit);
        inner.wake.notify_one();
    }

    fn record_progress(inner: &Arc<Inner>, id: &str, pct: u8) {
        let event = {
            let mut state = inner.state.lock().expect("state lock poisoned");
            let Some(job) = state.jobs.get_mut(id) else {
                return;
            };
            if job.status != JobStatus::Running {
                return;
            }
            let pct = pct.min(100);
            if pct <= job.progress {
                return;
            }
            job.progress = pct;
            JobEvent::progress(job, pct)
        };
        inner.events.emit(event);
    }

    fn finish(inner: &Arc<Inner>, id: &str, outcome: Result<Value, HandlerError>) {
        match outcome {
            Ok(result) => Inner::finish_completed(inner, id, result),
            Err(err) => Inner::finish_failed(inner, id, err),
        }
        Inner::maybe_drained(inner);
    }

    fn finish_completed(inner: &Arc<Inner>, id: &str, result: Value) {
        let job = {
            let mut state = inner.state.lock().expect("state lock poisoned");
            state.running.remove(id);
            let Some(job) = state.jobs.get_mut(id) else {
                return;
            };
            if !job.status.can_transition(JobStatus::Completed) {
                inner.telemetry.error(
                    COMPONENT,
                    &format!(
                        "illegal transition {} -> completed for job {}",
                        job.status.as_str(),
                        job.id
                    ),
                );
                return;
            }
            job.status = JobStatus::Completed;
            job.result = Some(result);
            job.completed_at = Some(Utc::now());
            job.clone()
        };

        inner.retries.clear(&job.original_id());
        Inner::persist(inner, &job);
        inner
            .events
            .emit(JobEvent::for_job(EventKind::JobCompleted, &job));
    }

    fn finish_failed(inner: &Arc<Inner>, id: &str, err: HandlerError) {
        let mut info = classify(&err);
        let options = {
            let state = inner.state.lock().expect("state lock poisoned");
            match state.jobs.get(id) {
                Some(job) => job.options.clone(),
                None => return,
            }
        };

        let original = original_id(id);
        let verdict = inner.retries.evaluate(
            &original,
            &options,
            &info,
            inner.config.base_retry_delay_ms,
        );

        match verdict {
            RetryVerdict::Schedule {
                retry_id,
                attempt,
                delay_ms,
            } => {
                // The pending-retry count is raised in the same critical
                // section that records the failure, so the server never
                // looks idle between the failure event and the retry timer.
                let job = Inner::mark_failed(inner, id, info, attempt, true);
                if let Some(job) = job {
                    inner.events.emit(JobEvent::failed(&job, true, attempt));
                    if attempt >= 3 {
                        inner.telemetry.warning(
                            COMPONENT,
                            &format!("approaching retry limit for {original}: attempt {attempt}"),
                        );
                    }
                    Inner::schedule_retry(inner.clone(), retry_id, job.data.clone(), options, delay_ms);
                }
            }
            RetryVerdict::CircuitTripped { attempts } => {
                info.circuit_breaker_tripped = true;
                info.code = Some("circuit-breaker-tripped".to_string());
                inner.telemetry.error(
                    COMPONENT,
                    &format!("circuit breaker triggered for {original} after {attempts} attempts"),
                );
                if let Some(job) = Inner::mark_failed(inner, id, info, attempts, false) {
                    inner.events.emit(JobEvent::failed(&job, false, attempts));
                }
            }
            RetryVerdict::Exhausted { attempts } => {
                inner.telemetry.warning(
                    COMPONENT,
                    &format!("max retries reached for {original} after {attempts} attempts"),
                );
                if let Some(job) = Inner::mark_failed(inner, id, info, attempts, false) {
                    inner.events.emit(JobEvent::failed(&job, false, attempts));
                }
            }
            RetryVerdict::NotRetryable { attempts } => {
                if let Some(job) = Inner::mark_failed(inner, id, info, attempts, false) {
                    inner.events.emit(JobEvent::failed(&job, false, attempts));
                }
            }
        }
    }

    fn mark_failed(
        inner: &Arc<Inner>,
        id: &str,
        info: super::error::JobErrorInfo,
        attempts: u32,
        retry_scheduled: bool,
    ) -> Option<Job> {
        let job = {
            let mut state = inner.state.lock().expect("state lock poisoned");
            state.running.remove(id);
            let Some(job) = state.jobs.get_mut(id) else {
                return None;
            };
            if !job.status.can_transition(JobStatus::Failed) {
                inner.telemetry.error(
                    COMPONENT,
                    &format!(
                        "illegal transition {} -> failed for job {}",
                        job.status.as_str(),
                        job.id
                    ),
                );
                return None;
            }
            job.status = JobStatus::Failed;
            job.error = Some(info);
            job.completed_at = Some(Utc::now());
            job.attempts = attempts;
            let job = job.clone();
            if retry_scheduled {
                state.pending_retries += 1;
            }
            job
        };
        Inner::persist(inner, &job);
        Some(job)
    }

    fn schedule_retry(
        inner: Arc<Inner>,
        retry_id: String,
        data: Value,
        options: JobOptions,
        delay_ms: u64,
    ) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            match Inner::create_internal(&inner, Some(retry_id.clone()), data, options, true) {
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("Failed to enqueue retry {}: {}", retry_id, err);
                    Inner::maybe_drained(&inner);
                }
            }
        });
    }

    fn maybe_drained(inner: &Arc<Inner>) {
        let idle = inner.state.lock().expect("state lock poisoned").is_idle();
        if idle {
            inner.events.emit(JobEvent::drained());
        }
    }
}
