//! Port-aware server bootstrap.
//!
//! Binds the preferred port with sequential fallback and coordinates
//! graceful shutdown: on a termination signal (or a component-requested
//! stop) the listener stops accepting, in-flight requests get a bounded
//! drain window, then the server is closed forcibly.

use std::time::Duration;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no free port in {first}..={last}")]
    NoFreePort { first: u16, last: u16 },
    #[error("bind failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Serve(String),
}

/// Tries `preferred`, then the next `fallback_count` ports in sequence.
/// Never wraps around the port space.
pub async fn bind_with_fallback(
    host: &str,
    preferred: u16,
    fallback_count: u16,
) -> Result<(TcpListener, u16), BootstrapError> {
    let last = preferred.saturating_add(fallback_count);
    for port in preferred..=last {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                if port != preferred {
                    tracing::warn!("Port {} busy, bound {} instead", preferred, port);
                }
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(err) => return Err(BootstrapError::Io(err)),
        }
    }
    Err(BootstrapError::NoFreePort {
        first: preferred,
        last,
    })
}

/// Lets any component request process shutdown with an exit code; the
/// bootstrap loop resolves with the first requested code.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    tx: watch::Sender<Option<i32>>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn request(&self, exit_code: i32) {
        // send_if_modified keeps the first requested code.
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(exit_code);
                true
            } else {
                false
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<i32>> {
        self.tx.subscribe()
    }

    pub fn requested(&self) -> Option<i32> {
        *self.tx.borrow()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves `app` until a termination signal or a controller request, then
/// drains for at most `drain_timeout_ms`. Returns the exit code.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    controller: &ShutdownController,
    drain_timeout_ms: u64,
) -> Result<i32, BootstrapError> {
    let controller = controller.clone();
    let mut trigger_rx = controller.subscribe();

    // Fold OS signals into the controller so both paths share one trigger.
    let signal_controller = controller.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Termination signal received, draining");
        signal_controller.request(0);
    });

    let graceful = {
        let mut rx = controller.subscribe();
        async move {
            // An already-requested shutdown resolves immediately.
            while rx.borrow_and_update().is_none() {
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    };

    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(graceful)
            .await
    });

    // Wait for the shutdown trigger, bailing out if the server dies first.
    loop {
        if trigger_rx.borrow_and_update().is_some() {
            break;
        }
        tokio::select! {
            changed = trigger_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            result = &mut server => {
                return match result {
                    Ok(Ok(())) => Ok(controller.requested().unwrap_or(0)),
                    Ok(Err(err)) => Err(BootstrapError::Serve(err.to_string())),
                    Err(join_err) => Err(BootstrapError::Serve(join_err.to_string())),
                };
            }
        }
    }
    let exit_code = controller.requested().unwrap_or(0);

    match tokio::time::timeout(Duration::from_millis(drain_timeout_ms), &mut server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => return Err(BootstrapError::Serve(err.to_string())),
        Ok(Err(join_err)) => return Err(BootstrapError::Serve(join_err.to_string())),
        Err(_) => {
            tracing::warn!(
                "Drain window of {}ms elapsed, closing remaining connections",
                drain_timeout_ms
            );
            server.abort();
        }
    }

    Ok(exit_code)
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_to_next_free_port() {
        // Occupy an OS-assigned port, then ask for it with fallback.
        let occupied = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let busy_port = occupied.local_addr().unwrap().port();

        let (listener, port) = bind_with_fallback("127.0.0.1", busy_port, 10)
            .await
            .unwrap();
        assert_ne!(port, busy_port);
        assert!(port > busy_port && port <= busy_port + 10);
        drop(listener);
    }

    #[tokio::test]
    async fn exhausted_sweep_is_terminal() {
        let first = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let base = first.local_addr().unwrap().port();
        // Try to also occupy base+1; skip the test if the neighbourhood is
        // contested.
        let Ok(second) = TcpListener::bind(("127.0.0.1", base + 1)).await else {
            return;
        };

        let result = bind_with_fallback("127.0.0.1", base, 1).await;
        assert!(matches!(
            result,
            Err(BootstrapError::NoFreePort { first: f, last: l }) if f == base && l == base + 1
        ));
        drop((first, second));
    }

    #[tokio::test]
    async fn controller_keeps_first_exit_code() {
        let controller = ShutdownController::new();
        assert_eq!(controller.requested(), None);
        controller.request(2);
        controller.request(0);
        assert_eq!(controller.requested(), Some(2));
    }
}
