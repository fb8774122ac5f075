use std::sync::Arc;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::server::events::ws_handler;
use crate::server::handlers::{health, jobs, pipelines};
use crate::state::AppState;

/// Main application router: health and status, job queries, pipeline
/// control, and the WebSocket event feed.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/status", get(health::get_status))
        .route("/api/secrets/health", get(health::secrets_health))
        .route("/api/jobs", get(jobs::list_jobs))
        .route("/api/jobs/:job_id", get(jobs::get_job))
        .route("/api/pipelines", get(pipelines::list_pipelines))
        .route("/api/pipelines/:name/trigger", post(pipelines::trigger))
        .route("/api/pipelines/:name/pause", post(pipelines::pause))
        .route("/api/pipelines/:name/resume", post(pipelines::resume))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
