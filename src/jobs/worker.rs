//! Handler capability.
//!
//! A worker is a job server configured with one handler and one job type.
//! Handlers receive a [`JobContext`] carrying the job snapshot, a progress
//! callback, and a cooperative cancellation signal.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use super::error::HandlerError;
use super::job::Job;

pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Clone)]
pub struct JobContext {
    job: Arc<Job>,
    progress: ProgressFn,
    cancel: watch::Receiver<bool>,
}

impl JobContext {
    pub fn new(job: Job, progress: ProgressFn, cancel: watch::Receiver<bool>) -> Self {
        Self {
            job: Arc::new(job),
            progress,
            cancel,
        }
    }

    /// Snapshot of the job at dispatch time.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Reports progress in [0, 100]. Forwarded to subscribers while the job
    /// is running; ignored otherwise.
    pub fn report_progress(&self, percent: u8) {
        (self.progress)(percent.min(100));
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when cancellation is requested. Never resolves if the job
    /// runs to completion first.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without a cancel: stay pending forever.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError>;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

struct FnHandler<F>(F);

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> BoxedHandlerFuture + Send + Sync,
{
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        (self.0)(ctx).await
    }
}

/// Adapts an async closure into a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(move |ctx| {
        Box::pin(f(ctx)) as BoxedHandlerFuture
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobOptions;
    use serde_json::json;

    fn context(cancel: watch::Receiver<bool>) -> JobContext {
        let job = Job::new("j1".into(), "repomix".into(), json!({}), JobOptions::default());
        JobContext::new(job, Arc::new(|_| {}), cancel)
    }

    #[tokio::test]
    async fn cancelled_resolves_on_signal() {
        let (tx, rx) = watch::channel(false);
        let ctx = context(rx);
        assert!(!ctx.is_cancelled());

        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.cancelled().await }
        });
        tx.send(true).unwrap();
        waiter.await.unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn handler_fn_adapts_closures() {
        let handler = handler_fn(|ctx: JobContext| async move {
            ctx.report_progress(50);
            Ok(json!({"id": ctx.job().id}))
        });
        let (_tx, rx) = watch::channel(false);
        let result = handler.handle(context(rx)).await.unwrap();
        assert_eq!(result, json!({"id": "j1"}));
    }
}
