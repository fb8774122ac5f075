//! Retry bookkeeping keyed by original job id.
//!
//! All retry state is anchored to the retry-suffix-stripped id so a chain
//! of retries shares one attempt counter. The absolute cap cannot be
//! raised by per-job configuration.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::JobErrorInfo;
use super::job::JobOptions;

/// Hard cap on attempts per original id, regardless of `max_retries`.
pub const ABSOLUTE_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryInfo {
    pub attempts: u32,
    pub last_attempt_at: DateTime<Utc>,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

/// Outcome of a failure evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryVerdict {
    Schedule {
        retry_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// Absolute cap reached; terminal with a distinguished marker.
    CircuitTripped { attempts: u32 },
    /// Per-job `max_retries` exhausted.
    Exhausted { attempts: u32 },
    /// Classifier ruled the failure terminal.
    NotRetryable { attempts: u32 },
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RetrySummary {
    pub tracked: usize,
    pub total_attempts: u32,
}

#[derive(Debug, Default)]
pub struct RetryTable {
    // Plain mutex: never held across a suspension point.
    entries: Mutex<HashMap<String, RetryInfo>>,
}

impl RetryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure for `original_id` and decides what happens next.
    /// Entries are dropped on every terminal verdict; the caller clears on
    /// success via [`RetryTable::clear`].
    pub fn evaluate(
        &self,
        original_id: &str,
        options: &JobOptions,
        error: &JobErrorInfo,
        default_base_delay_ms: u64,
    ) -> RetryVerdict {
        let mut entries = self.entries.lock().expect("retry table lock poisoned");
        let info = entries
            .entry(original_id.to_string())
            .or_insert_with(|| RetryInfo {
                attempts: 0,
                last_attempt_at: Utc::now(),
                max_attempts: options.max_retries,
                base_delay_ms: options.retry_delay_ms.unwrap_or(default_base_delay_ms),
            });

        info.attempts += 1;
        info.last_attempt_at = Utc::now();
        let attempts = info.attempts;

        if attempts >= ABSOLUTE_MAX_RETRIES {
            entries.remove(original_id);
            return RetryVerdict::CircuitTripped { attempts };
        }
        if attempts > options.max_retries {
            entries.remove(original_id);
            return RetryVerdict::Exhausted { attempts };
        }
        if !error.retryable {
            entries.remove(original_id);
            return RetryVerdict::NotRetryable { attempts };
        }

        // Per-job delay override wins over the classifier suggestion.
        let base = options
            .retry_delay_ms
            .unwrap_or(error.suggested_delay_ms.max(1));
        let delay_ms = base.saturating_mul(1u64 << (attempts - 1).min(32));
        RetryVerdict::Schedule {
            retry_id: format!("{original_id}-retry{attempts}"),
            attempt: attempts,
            delay_ms,
        }
    }

    /// Drops the chain's bookkeeping after a success.
    pub fn clear(&self, original_id: &str) {
        self.entries
            .lock()
            .expect("retry table lock poisoned")
            .remove(original_id);
    }

    pub fn get(&self, original_id: &str) -> Option<RetryInfo> {
        self.entries
            .lock()
            .expect("retry table lock poisoned")
            .get(original_id)
            .cloned()
    }

    pub fn summary(&self) -> RetrySummary {
        let entries = self.entries.lock().expect("retry table lock poisoned");
        RetrySummary {
            tracked: entries.len(),
            total_attempts: entries.values().map(|info| info.attempts).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::classifier::classify;
    use crate::jobs::error::HandlerError;

    fn retryable_error() -> JobErrorInfo {
        classify(&HandlerError::with_code("slow", "timed-out"))
    }

    fn terminal_error() -> JobErrorInfo {
        classify(&HandlerError::with_code("gone", "file-not-found"))
    }

    #[test]
    fn schedules_with_exponential_backoff() {
        let table = RetryTable::new();
        let options = JobOptions {
            max_retries: 3,
            retry_delay_ms: Some(100),
            ..JobOptions::default()
        };

        match table.evaluate("j", &options, &retryable_error(), 5000) {
            RetryVerdict::Schedule {
                retry_id,
                attempt,
                delay_ms,
            } => {
                assert_eq!(retry_id, "j-retry1");
                assert_eq!(attempt, 1);
                assert_eq!(delay_ms, 100);
            }
            other => panic!("unexpected verdict: {other:?}"),
        }

        match table.evaluate("j", &options, &retryable_error(), 5000) {
            RetryVerdict::Schedule { retry_id, delay_ms, .. } => {
                assert_eq!(retry_id, "j-retry2");
                assert_eq!(delay_ms, 200);
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn classifier_delay_used_without_per_job_override() {
        let table = RetryTable::new();
        let options = JobOptions {
            max_retries: 3,
            ..JobOptions::default()
        };
        match table.evaluate("j", &options, &retryable_error(), 5000) {
            RetryVerdict::Schedule { delay_ms, .. } => assert_eq!(delay_ms, 5000),
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn per_job_max_exhausts() {
        let table = RetryTable::new();
        let options = JobOptions {
            max_retries: 1,
            retry_delay_ms: Some(10),
            ..JobOptions::default()
        };
        assert!(matches!(
            table.evaluate("j", &options, &retryable_error(), 5000),
            RetryVerdict::Schedule { .. }
        ));
        assert_eq!(
            table.evaluate("j", &options, &retryable_error(), 5000),
            RetryVerdict::Exhausted { attempts: 2 }
        );
        // Bookkeeping dropped on the terminal verdict.
        assert!(table.get("j").is_none());
    }

    #[test]
    fn absolute_cap_trips_regardless_of_options() {
        let table = RetryTable::new();
        let options = JobOptions {
            max_retries: 100,
            retry_delay_ms: Some(10),
            ..JobOptions::default()
        };
        for attempt in 1..ABSOLUTE_MAX_RETRIES {
            assert!(matches!(
                table.evaluate("j", &options, &retryable_error(), 5000),
                RetryVerdict::Schedule { attempt: a, .. } if a == attempt
            ));
        }
        assert_eq!(
            table.evaluate("j", &options, &retryable_error(), 5000),
            RetryVerdict::CircuitTripped {
                attempts: ABSOLUTE_MAX_RETRIES
            }
        );
        assert!(table.get("j").is_none());
    }

    #[test]
    fn non_retryable_drops_state_immediately() {
        let table = RetryTable::new();
        let options = JobOptions::default();
        assert_eq!(
            table.evaluate("j", &options, &terminal_error(), 5000),
            RetryVerdict::NotRetryable { attempts: 1 }
        );
        assert!(table.get("j").is_none());
    }

    #[test]
    fn clear_removes_chain_state() {
        let table = RetryTable::new();
        let options = JobOptions {
            retry_delay_ms: Some(10),
            ..JobOptions::default()
        };
        table.evaluate("j", &options, &retryable_error(), 5000);
        assert!(table.get("j").is_some());
        table.clear("j");
        assert!(table.get("j").is_none());
        assert_eq!(table.summary().tracked, 0);
    }
}
