//! Secrets resilience layer.
//!
//! [`SecretsService::get`] returns a snapshot of the configuration map,
//! surviving upstream outages: a circuit breaker suppresses calls to a
//! failing endpoint and an on-disk fallback cache serves the last known
//! snapshot while the circuit is open. Concurrent callers share a single
//! in-flight fetch.

mod breaker;
mod cache;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState, Transition};
pub use cache::{CacheFreshness, FallbackCache};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::core::config::Settings;
use crate::telemetry::Telemetry;

const COMPONENT: &str = "secrets";

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("secrets endpoint request failed: {0}")]
    Upstream(String),
    #[error("circuit open and no fallback cache at {}", .0.display())]
    NoFallback(PathBuf),
    #[error("fallback cache error: {0}")]
    Cache(String),
}

impl SecretsError {
    /// `NoFallback` is terminal so callers do not retry in a tight loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SecretsError::Upstream(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Live,
    Cache,
}

/// Read-only configuration snapshot. Immutable per call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsSnapshot {
    pub values: HashMap<String, String>,
    pub fetched_at: DateTime<Utc>,
    pub source: SnapshotSource,
    pub circuit_state: CircuitState,
}

#[async_trait]
pub trait SecretsClient: Send + Sync {
    async fn fetch(&self) -> Result<HashMap<String, String>, SecretsError>;
}

/// Fetches the secrets map from an HTTP endpoint returning a flat JSON
/// object. Non-string values are stringified.
pub struct HttpSecretsClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpSecretsClient {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            token,
        }
    }
}

#[async_trait]
impl SecretsClient for HttpSecretsClient {
    async fn fetch(&self) -> Result<HashMap<String, String>, SecretsError> {
        let mut request = self.http.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SecretsError::Upstream(e.to_string()))?
            .error_for_status()
            .map_err(|e| SecretsError::Upstream(e.to_string()))?;

        let body: serde_json::Map<String, serde_json::Value> = response
            .json()
            .await
            .map_err(|e| SecretsError::Upstream(e.to_string()))?;

        Ok(body
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(s) => (key, s),
                other => (key, other.to_string()),
            })
            .collect())
    }
}

/// Snapshots process environment variables carrying a prefix. Used when no
/// secrets endpoint is configured, so a standalone deployment still boots.
pub struct EnvSecretsClient {
    prefix: String,
}

impl EnvSecretsClient {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl SecretsClient for EnvSecretsClient {
    async fn fetch(&self) -> Result<HashMap<String, String>, SecretsError> {
        Ok(std::env::vars()
            .filter_map(|(key, value)| {
                let stripped = key.strip_prefix(&self.prefix)?;
                Some((stripped.to_string(), value))
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsHealth {
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_requests: u64,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_freshness: Option<CacheFreshness>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_in_ms: Option<u64>,
}

pub struct SecretsService {
    client: Arc<dyn SecretsClient>,
    cache: FallbackCache,
    breaker: Mutex<CircuitBreaker>,
    telemetry: Arc<dyn Telemetry>,
    fetch_lock: tokio::sync::Mutex<()>,
    last_live: Mutex<Option<(Instant, SecretsSnapshot)>>,
}

impl SecretsService {
    pub fn new(
        client: Arc<dyn SecretsClient>,
        cache: FallbackCache,
        breaker_config: BreakerConfig,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            client,
            cache,
            breaker: Mutex::new(CircuitBreaker::new(breaker_config)),
            telemetry,
            fetch_lock: tokio::sync::Mutex::new(()),
            last_live: Mutex::new(None),
        }
    }

    /// Returns the current secrets snapshot, live when the circuit allows
    /// it, otherwise from the fallback cache.
    pub async fn get(&self) -> Result<SecretsSnapshot, SecretsError> {
        let arrived = Instant::now();
        let _flight = self.fetch_lock.lock().await;

        // A fetch that completed while we queued behind the lock is shared
        // rather than stampeding the upstream again.
        if let Some((at, snapshot)) = self
            .last_live
            .lock()
            .expect("secrets lock poisoned")
            .clone()
        {
            if at >= arrived {
                return Ok(snapshot);
            }
        }

        let now = Instant::now();
        let attempt = self
            .breaker
            .lock()
            .expect("breaker lock poisoned")
            .should_attempt(now);
        if !attempt {
            return self.from_cache(CircuitState::Open);
        }

        match self.client.fetch().await {
            Ok(values) => {
                let transition = self
                    .breaker
                    .lock()
                    .expect("breaker lock poisoned")
                    .on_success();
                if transition == Some(Transition::Closed) {
                    self.telemetry.info(COMPONENT, "circuit closed");
                }
                if let Err(err) = self.cache.store(&values) {
                    tracing::warn!("Failed to write secrets fallback cache: {}", err);
                }
                let snapshot = SecretsSnapshot {
                    values,
                    fetched_at: Utc::now(),
                    source: SnapshotSource::Live,
                    circuit_state: self.state(),
                };
                *self.last_live.lock().expect("secrets lock poisoned") =
                    Some((Instant::now(), snapshot.clone()));
                Ok(snapshot)
            }
            Err(err) => {
                let transition = self
                    .breaker
                    .lock()
                    .expect("breaker lock poisoned")
                    .on_failure(Instant::now());
                match transition {
                    Some(Transition::Opened) => {
                        self.telemetry.error(COMPONENT, "circuit opened");
                    }
                    Some(Transition::Reopened) => {
                        self.telemetry.warning(COMPONENT, "half-open probe failed, circuit reopened");
                    }
                    _ => {}
                }
                tracing::warn!("Live secrets fetch failed: {}", err);
                match self.from_cache(self.state()) {
                    Ok(snapshot) => Ok(snapshot),
                    Err(SecretsError::NoFallback(_)) if self.state() != CircuitState::Open => {
                        // Still closed or half-open with nothing cached:
                        // surface the upstream error, which is retryable.
                        Err(err)
                    }
                    Err(cache_err) => Err(cache_err),
                }
            }
        }
    }

    /// Typed settings view of the current snapshot.
    pub async fn settings(&self) -> Result<Settings, SecretsError> {
        let snapshot = self.get().await?;
        Ok(Settings::from_map(&snapshot.values))
    }

    pub fn health(&self) -> SecretsHealth {
        let breaker = self.breaker.lock().expect("breaker lock poisoned");
        SecretsHealth {
            state: breaker.state(),
            failure_count: breaker.failure_count(),
            total_requests: breaker.total_requests(),
            success_rate: breaker.success_rate(),
            cache_age_secs: self.cache.age().map(|age| age.as_secs()),
            cache_freshness: self.cache.freshness(),
            next_attempt_in_ms: breaker
                .next_attempt_in(Instant::now())
                .map(|d| d.as_millis() as u64),
        }
    }

    pub fn cache(&self) -> &FallbackCache {
        &self.cache
    }

    fn state(&self) -> CircuitState {
        self.breaker.lock().expect("breaker lock poisoned").state()
    }

    fn from_cache(&self, circuit_state: CircuitState) -> Result<SecretsSnapshot, SecretsError> {
        match self.cache.load()? {
            Some((values, fetched_at)) => Ok(SecretsSnapshot {
                values,
                fetched_at,
                source: SnapshotSource::Cache,
                circuit_state,
            }),
            None => Err(SecretsError::NoFallback(self.cache.path().to_path_buf())),
        }
    }
}
