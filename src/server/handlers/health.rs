use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use crate::core::errors::ApiError;
use crate::state::AppState;

pub async fn health(State(_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let counts = state.store.counts(None).map_err(ApiError::internal)?;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
        "jobs": counts,
        "pipelines": state.pipelines.stats(),
        "secrets": state.secrets.health(),
        "dryRun": state.settings.dry_run,
    })))
}

pub async fn secrets_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.secrets.health())
}
