//! AlephAuto backend server.
//!
//! Boots the pipeline registry, binds the HTTP surface with port
//! fallback, and runs until a termination signal. Exit codes: 0 on a
//! clean stop, 1 on an unrecoverable bootstrap failure, 2 when a
//! migration rollback left a repository needing manual recovery.

use alephauto_backend::core::config::AppPaths;
use alephauto_backend::server::{bind_with_fallback, router, serve};
use alephauto_backend::state::AppState;
use alephauto_backend::{logging, pipelines};

const DRAIN_TIMEOUT_MS: u64 = 10_000;

#[tokio::main]
async fn main() {
    let paths = AppPaths::new();
    logging::init(&paths);

    let exit_code = match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("Fatal bootstrap error: {:#}", err);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> anyhow::Result<i32> {
    tracing::info!("Starting AlephAuto backend...");

    let state = AppState::initialize().await?;
    tracing::info!(
        "Initialized {} pipeline(s): {}",
        state.pipelines.names().len(),
        state.pipelines.names().join(", ")
    );

    let host = std::env::var("ALEPH_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let (listener, port) = bind_with_fallback(
        &host,
        state.settings.preferred_port,
        state.settings.port_fallback_count,
    )
    .await?;
    tracing::info!("Server listening on http://{}:{}", host, port);

    let app = router(state.clone());
    let exit_code = serve(listener, app, &state.shutdown, DRAIN_TIMEOUT_MS).await?;

    state.pipelines.shutdown().await;
    if exit_code == pipelines::EXIT_ROLLBACK_FAILURE {
        tracing::error!("Exiting with repository integrity failure");
    }
    Ok(exit_code)
}
