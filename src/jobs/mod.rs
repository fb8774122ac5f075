//! Job execution engine.
//!
//! The job server owns a bounded queue, a concurrency-limited dispatcher,
//! a per-job state machine, database-backed persistence, event emission,
//! and retry orchestration with an absolute retry cap.

pub mod classifier;
pub mod error;
pub mod events;
pub mod job;
pub mod retry;
pub mod server;
pub mod store;
pub mod worker;

pub use classifier::classify;
pub use error::{ErrorCategory, HandlerError, JobErrorInfo};
pub use events::{EventBus, EventKind, JobEvent};
pub use job::{original_id, Job, JobOptions, JobStatus};
pub use retry::{RetryInfo, RetrySummary, RetryTable, RetryVerdict, ABSOLUTE_MAX_RETRIES};
pub use server::{JobServer, JobServerConfig, JobServerError};
pub use store::{JobCounts, JobFilter, JobStore, MemoryJobStore, SqliteJobStore, StoreError};
pub use worker::{handler_fn, JobContext, JobHandler};
