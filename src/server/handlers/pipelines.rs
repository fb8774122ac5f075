use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::core::errors::ApiError;
use crate::jobs::JobServerError;
use crate::pipelines::Pipeline;
use crate::state::AppState;

pub async fn list_pipelines(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "pipelines": state.pipelines.stats() }))
}

pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let pipeline = lookup(&state, &name)?;
    let data = body.map(|Json(value)| value).unwrap_or(Value::Null);
    let job_id = pipeline.trigger_with(data).map_err(map_server_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "jobId": job_id, "pipeline": name })),
    ))
}

pub async fn pause(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pipeline = lookup(&state, &name)?;
    pipeline.server().pause();
    Ok(Json(json!({ "pipeline": name, "paused": true })))
}

pub async fn resume(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pipeline = lookup(&state, &name)?;
    pipeline.server().resume();
    Ok(Json(json!({ "pipeline": name, "paused": false })))
}

fn lookup(state: &AppState, name: &str) -> Result<Arc<Pipeline>, ApiError> {
    state
        .pipelines
        .get(name)
        .ok_or_else(|| ApiError::NotFound(format!("pipeline {name}")))
}

fn map_server_error(err: JobServerError) -> ApiError {
    match err {
        JobServerError::QueueFull { .. } => ApiError::Capacity(err.to_string()),
        JobServerError::Stopping => ApiError::ServiceUnavailable,
        JobServerError::Duplicate(_) => ApiError::BadRequest(err.to_string()),
        JobServerError::NotFound(_) => ApiError::NotFound(err.to_string()),
    }
}
