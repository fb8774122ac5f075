//! Pipeline scaffolding.
//!
//! A pipeline connects one worker (a job server with one handler and one
//! job type) to an optional cron trigger. The wrapped handler serializes
//! jobs per repository path and, when enabled, runs the git workflow over
//! whatever the handler changed.

pub mod command;
pub mod cron;

pub use command::CommandJobHandler;
pub use cron::{CronError, CronTrigger};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::gitflow::{BranchRequest, GitWorkflow};
use crate::jobs::{
    EventBus, HandlerError, Job, JobContext, JobHandler, JobServer, JobServerConfig,
    JobServerError, JobStore, RetrySummary,
};
use crate::jobs::store::JobCounts;
use crate::server::bootstrap::ShutdownController;
use crate::telemetry::Telemetry;

/// Exit code for a repository left with an unrecoverable stash after a
/// migration rollback.
pub const EXIT_ROLLBACK_FAILURE: i32 = 2;

/// Async lock registry implementing the one-job-per-repository policy.
#[derive(Default)]
pub struct RepoLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, path: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let lock = {
            let mut locks = self.locks.lock().expect("repo locks poisoned");
            locks
                .entry(canonical)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub name: String,
    pub counts: JobCounts,
    pub queue_depth: usize,
    pub running: usize,
    pub retries: RetrySummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    pub paused: bool,
}

pub struct PipelineConfig {
    pub name: String,
    pub server: JobServerConfig,
    pub default_data: Value,
    pub git_workflow: bool,
    pub cron: Option<String>,
}

pub struct Pipeline {
    name: String,
    server: JobServer,
    default_data: Value,
    trigger: Mutex<Option<CronTrigger>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        handler: Arc<dyn JobHandler>,
        store: Arc<dyn JobStore>,
        telemetry: Arc<dyn Telemetry>,
        git: Option<Arc<GitWorkflow>>,
        repo_locks: Arc<RepoLocks>,
        shutdown: ShutdownController,
    ) -> Arc<Self> {
        let wrapped = Arc::new(WrappedHandler {
            inner: handler,
            git: if config.git_workflow { git } else { None },
            repo_locks,
            telemetry: telemetry.clone(),
            shutdown,
        });
        let server = JobServer::new(config.server, wrapped, store, telemetry);
        let pipeline = Arc::new(Self {
            name: config.name,
            server,
            default_data: config.default_data,
            trigger: Mutex::new(None),
        });

        if let Some(expr) = config.cron {
            if let Err(err) = pipeline.schedule_cron(&expr) {
                tracing::warn!("Pipeline {}: {}", pipeline.name, err);
            }
        }
        pipeline
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &JobServer {
        &self.server
    }

    /// Registers the cron trigger; each firing enqueues the default job.
    pub fn schedule_cron(self: &Arc<Self>, expr: &str) -> Result<(), CronError> {
        let weak = Arc::downgrade(self);
        let trigger = CronTrigger::schedule(expr, move || {
            let Some(pipeline) = weak.upgrade() else {
                return;
            };
            match pipeline.trigger_default() {
                Ok(job_id) => {
                    tracing::info!("Pipeline {} cron fired, queued {}", pipeline.name, job_id)
                }
                Err(err) => {
                    tracing::warn!("Pipeline {} cron firing rejected: {}", pipeline.name, err)
                }
            }
        })?;
        *self.trigger.lock().expect("trigger lock poisoned") = Some(trigger);
        Ok(())
    }

    /// Enqueues the pipeline's default job.
    pub fn trigger_default(&self) -> Result<String, JobServerError> {
        self.server.create_job(self.default_data.clone())
    }

    pub fn trigger_with(&self, data: Value) -> Result<String, JobServerError> {
        let merged = if data.is_null() {
            self.default_data.clone()
        } else {
            data
        };
        self.server.create_job(merged)
    }

    /// Event-driven wait until the worker is idle.
    pub async fn wait_for_completion(
        &self,
        timeout_ms: u64,
    ) -> Result<(), crate::jobs::server::WaitError> {
        self.server.wait_for_completion(timeout_ms).await
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            name: self.name.clone(),
            counts: self.server.get_counts(),
            queue_depth: self.server.queue_depth(),
            running: self.server.running_count(),
            retries: self.server.retry_summary(),
            cron: self
                .trigger
                .lock()
                .expect("trigger lock poisoned")
                .as_ref()
                .map(|t| t.expression().to_string()),
            paused: self.server.is_paused(),
        }
    }

    pub async fn shutdown(&self) {
        // Stop the trigger first so nothing new is enqueued mid-drain.
        self.trigger.lock().expect("trigger lock poisoned").take();
        self.server.shutdown().await;
    }
}

/// Registry of configured pipelines plus the aggregate event feed.
pub struct PipelineManager {
    pipelines: Mutex<HashMap<String, Arc<Pipeline>>>,
    events: EventBus,
}

impl PipelineManager {
    pub fn new() -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            events: EventBus::default(),
        }
    }

    /// Adds a pipeline and forwards its events into the aggregate bus.
    pub fn register(&self, pipeline: Arc<Pipeline>) {
        let mut rx = pipeline.server().subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => events.emit(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event forwarder lagged, skipped {} events", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.pipelines
            .lock()
            .expect("pipelines lock poisoned")
            .insert(pipeline.name().to_string(), pipeline);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines
            .lock()
            .expect("pipelines lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pipelines
            .lock()
            .expect("pipelines lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> Vec<PipelineStats> {
        let pipelines: Vec<Arc<Pipeline>> = self
            .pipelines
            .lock()
            .expect("pipelines lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut stats: Vec<PipelineStats> = pipelines.iter().map(|p| p.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn find_job(&self, id: &str) -> Option<Job> {
        let pipelines: Vec<Arc<Pipeline>> = self
            .pipelines
            .lock()
            .expect("pipelines lock poisoned")
            .values()
            .cloned()
            .collect();
        pipelines.iter().find_map(|p| p.server().get_job(id))
    }

    pub async fn shutdown(&self) {
        let pipelines: Vec<Arc<Pipeline>> = self
            .pipelines
            .lock()
            .expect("pipelines lock poisoned")
            .values()
            .cloned()
            .collect();
        for pipeline in pipelines {
            pipeline.shutdown().await;
        }
    }
}

impl Default for PipelineManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Decorates the pipeline handler with repository serialization and the
/// git workflow pass.
struct WrappedHandler {
    inner: Arc<dyn JobHandler>,
    git: Option<Arc<GitWorkflow>>,
    repo_locks: Arc<RepoLocks>,
    telemetry: Arc<dyn Telemetry>,
    shutdown: ShutdownController,
}

#[async_trait]
impl JobHandler for WrappedHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        let repo_path = repository_path(ctx.job());
        let _guard = match &repo_path {
            Some(path) => Some(self.repo_locks.lock(path).await),
            None => None,
        };

        let result = match self.inner.handle(ctx.clone()).await {
            Ok(result) => result,
            Err(err) => {
                if err.code.as_deref() == Some("rollback-failed") {
                    self.telemetry.critical(
                        "pipelines",
                        &format!(
                            "repository integrity failure during rollback: {}",
                            err.message
                        ),
                    );
                    self.shutdown.request(EXIT_ROLLBACK_FAILURE);
                }
                return Err(err);
            }
        };

        let (Some(git), Some(path)) = (&self.git, &repo_path) else {
            return Ok(result);
        };
        if !git.is_repo(path).await || !git.has_changes(path).await.unwrap_or(false) {
            return Ok(result);
        }

        let job = ctx.job();
        let title = format!("{}: automated maintenance", job.job_type);
        let body = format!(
            "Automated changes produced by the `{}` pipeline for job `{}`.",
            job.job_type, job.id
        );
        let outcome = git
            .publish_changes(
                path,
                &BranchRequest {
                    job_id: &job.id,
                    job_type: &job.job_type,
                    description: job.data.get("description").and_then(|v| v.as_str()),
                },
                &title,
                &title,
                &body,
                &[],
            )
            .await
            .map_err(|e| HandlerError::with_code(e.to_string(), "git-error"))?;

        // Push/PR problems are flagged in the payload without failing the
        // job.
        let mut result = result;
        if let Value::Object(map) = &mut result {
            map.insert("gitWorkflow".to_string(), json!(outcome));
        } else {
            result = json!({ "result": result, "gitWorkflow": outcome });
        }
        Ok(result)
    }
}

fn repository_path(job: &Job) -> Option<PathBuf> {
    job.data
        .get("repositoryPath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
}
