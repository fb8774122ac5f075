//! Cron trigger.
//!
//! One background task per schedule; each firing invokes the supplied
//! callback. The task stops when the trigger handle is dropped.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression {expr:?}: {message}")]
    Invalid { expr: String, message: String },
}

pub struct CronTrigger {
    expr: String,
    handle: JoinHandle<()>,
}

impl CronTrigger {
    /// Parses `expr` (seconds-resolution, 6 or 7 fields) and spawns the
    /// firing loop.
    pub fn schedule<F>(expr: &str, on_fire: F) -> Result<Self, CronError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let schedule = Schedule::from_str(expr).map_err(|e| CronError::Invalid {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;

        let on_fire = Arc::new(on_fire);
        let expr_owned = expr.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    tracing::warn!("Cron expression {:?} has no future firings", expr_owned);
                    return;
                };
                let until = match (next - Utc::now()).to_std() {
                    Ok(duration) => duration,
                    Err(_) => continue,
                };
                tokio::time::sleep(until).await;
                on_fire();
            }
        });

        Ok(Self {
            expr: expr.to_string(),
            handle,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }
}

impl Drop for CronTrigger {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
