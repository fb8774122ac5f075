//! Global application state shared across routes and background tasks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::config::{AppPaths, Settings};
use crate::gitflow::{GitWorkflow, GitWorkflowConfig};
use crate::jobs::{JobServerConfig, JobStore, SqliteJobStore};
use crate::pipelines::{
    CommandJobHandler, Pipeline, PipelineConfig, PipelineManager, RepoLocks,
};
use crate::secrets::{
    BreakerConfig, EnvSecretsClient, FallbackCache, HttpSecretsClient, SecretsClient,
    SecretsService,
};
use crate::server::bootstrap::ShutdownController;
use crate::telemetry::{Telemetry, TracingTelemetry};

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Failed to load configuration: {0}")]
    Secrets(#[from] crate::secrets::SecretsError),
    #[error("Failed to initialize job store: {0}")]
    Store(#[from] crate::jobs::StoreError),
}

pub struct AppState {
    pub paths: AppPaths,
    pub settings: Settings,
    pub secrets: Arc<SecretsService>,
    pub telemetry: Arc<dyn Telemetry>,
    pub store: Arc<dyn JobStore>,
    pub pipelines: PipelineManager,
    pub shutdown: ShutdownController,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Builds the full application: secrets service (with circuit breaker
    /// defaults refined by the snapshot itself), job store, and one
    /// pipeline per configured spec.
    pub async fn initialize() -> Result<Arc<Self>, InitializationError> {
        let paths = AppPaths::new();
        let telemetry: Arc<dyn Telemetry> = Arc::new(TracingTelemetry);

        let client: Arc<dyn SecretsClient> = match std::env::var("ALEPH_SECRETS_URL") {
            Ok(url) => {
                let token = std::env::var("ALEPH_SECRETS_TOKEN").ok();
                Arc::new(HttpSecretsClient::new(url, token))
            }
            Err(_) => Arc::new(EnvSecretsClient::new("ALEPH_")),
        };

        // Bootstrap pass with breaker defaults; the snapshot may then move
        // the cache path and breaker thresholds for subsequent calls.
        let bootstrap_secrets = SecretsService::new(
            client.clone(),
            FallbackCache::new(paths.secrets_cache_path.clone()),
            BreakerConfig::default(),
            telemetry.clone(),
        );
        let settings = bootstrap_secrets.settings().await?;

        let cache_path = settings
            .cache_path
            .clone()
            .unwrap_or_else(|| paths.secrets_cache_path.clone());
        let secrets = Arc::new(SecretsService::new(
            client,
            FallbackCache::new(cache_path),
            breaker_config(&settings),
            telemetry.clone(),
        ));

        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(paths.db_path.clone())?);
        let shutdown = ShutdownController::new();

        let git = match GitWorkflow::new(GitWorkflowConfig {
            base_branch: settings.base_branch.clone(),
            branch_prefix: settings.branch_prefix.clone(),
            dry_run: settings.dry_run,
            github_token: settings.github_token.clone(),
            ..GitWorkflowConfig::default()
        }) {
            Ok(git) => Some(Arc::new(git)),
            Err(err) => {
                tracing::warn!("Git workflow disabled: {}", err);
                None
            }
        };

        let pipelines = PipelineManager::new();
        let repo_locks = Arc::new(RepoLocks::new());
        for spec in &settings.pipelines {
            let handler = match CommandJobHandler::new(&spec.command) {
                Ok(handler) => Arc::new(handler),
                Err(err) => {
                    tracing::warn!("Pipeline {} misconfigured: {}", spec.name, err);
                    continue;
                }
            };
            let mut default_data = serde_json::Map::new();
            if let Some(repo) = &spec.repository_path {
                default_data.insert(
                    "repositoryPath".to_string(),
                    serde_json::Value::String(repo.clone()),
                );
            }
            let pipeline = Pipeline::new(
                PipelineConfig {
                    name: spec.name.clone(),
                    server: JobServerConfig {
                        job_type: spec.name.clone(),
                        max_concurrent: spec.max_concurrent.unwrap_or(settings.max_concurrent),
                        queue_max_size: settings.queue_max_size,
                        default_timeout_ms: settings.job_timeout_ms,
                        base_retry_delay_ms: settings.retry_delay_ms,
                        default_max_retries: settings.max_retries,
                        ..JobServerConfig::default()
                    },
                    default_data: serde_json::Value::Object(default_data),
                    git_workflow: spec.git_workflow,
                    cron: spec.cron.clone(),
                },
                handler,
                store.clone(),
                telemetry.clone(),
                git.clone(),
                repo_locks.clone(),
                shutdown.clone(),
            );
            pipelines.register(pipeline);
        }

        Ok(Arc::new(AppState {
            paths,
            settings,
            secrets,
            telemetry,
            store,
            pipelines,
            shutdown,
            started_at: Utc::now(),
        }))
    }
}

fn breaker_config(settings: &Settings) -> BreakerConfig {
    BreakerConfig {
        failure_threshold: settings.failure_threshold,
        success_threshold: settings.success_threshold,
        timeout: std::time::Duration::from_millis(settings.circuit_timeout_ms),
        multiplier: settings.backoff_multiplier,
        max_backoff: std::time::Duration::from_millis(settings.max_backoff_ms),
        ..BreakerConfig::default()
    }
}
