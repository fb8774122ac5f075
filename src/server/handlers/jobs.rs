use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::core::errors::ApiError;
use crate::jobs::store::JobFilter;
use crate::jobs::JobStatus;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Deserialize, Default)]
pub struct JobsQuery {
    #[serde(rename = "type")]
    job_type: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<JobStatus>()
                .map_err(ApiError::BadRequest)?,
        ),
        None => None,
    };
    let filter = JobFilter {
        job_type: query.job_type,
        status,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIMIT)),
    };
    let jobs = state.store.load(&filter).map_err(ApiError::internal)?;
    Ok(Json(json!({ "jobs": jobs })))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // Live state first, then the store for jobs from previous runs.
    if let Some(job) = state.pipelines.find_job(&job_id) {
        return Ok(Json(json!({ "job": job })));
    }

    let filter = JobFilter::default();
    let job = state
        .store
        .load(&filter)
        .map_err(ApiError::internal)?
        .into_iter()
        .find(|job| job.id == job_id)
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;
    Ok(Json(json!({ "job": job })))
}
