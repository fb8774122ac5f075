//! The job entity and its state machine.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::JobErrorInfo;

static RETRY_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-retry\d+").expect("retry suffix regex"));

/// Strips every `-retryN` suffix, yielding the id that anchors all retry
/// bookkeeping for the chain.
pub fn original_id(id: &str) -> String {
    RETRY_SUFFIX.replace_all(id, "").into_owned()
}

/// Retry ordinal encoded in the id, if any (`job-retry3` -> 3).
pub(crate) fn retry_ordinal(id: &str) -> Option<u32> {
    static TRAILING: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"-retry(\d+)$").expect("trailing retry regex"));
    TRAILING
        .captures(id)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Legal transitions of the per-job state machine. A terminal status is
    /// never left.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Created, JobStatus::Queued)
                | (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "created" => Ok(JobStatus::Created),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    pub max_retries: u32,
    /// Per-job base retry delay. When set it overrides the classifier's
    /// suggested delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: None,
            priority: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub data: Value,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default)]
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorInfo>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    pub fn new(id: String, job_type: String, data: Value, options: JobOptions) -> Self {
        let attempts = retry_ordinal(&id).unwrap_or(0);
        Self {
            id,
            job_type,
            status: JobStatus::Created,
            data,
            options,
            progress: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts,
        }
    }

    pub fn original_id(&self) -> String {
        original_id(&self.id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn original_id_strips_all_retry_suffixes() {
        assert_eq!(original_id("job-1"), "job-1");
        assert_eq!(original_id("job-1-retry1"), "job-1");
        assert_eq!(original_id("job-1-retry1-retry2"), "job-1");
        assert_eq!(original_id("job-retry"), "job-retry");
    }

    #[test]
    fn retry_ordinal_reads_trailing_suffix() {
        assert_eq!(retry_ordinal("job-1"), None);
        assert_eq!(retry_ordinal("job-1-retry3"), Some(3));
        assert_eq!(
            Job::new("j-retry2".into(), "repomix".into(), json!({}), JobOptions::default())
                .attempts,
            2
        );
    }

    #[test]
    fn state_machine_rejects_illegal_transitions() {
        assert!(JobStatus::Created.can_transition(JobStatus::Queued));
        assert!(JobStatus::Queued.can_transition(JobStatus::Running));
        assert!(JobStatus::Running.can_transition(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition(JobStatus::Failed));

        assert!(!JobStatus::Completed.can_transition(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition(JobStatus::Queued));
        assert!(!JobStatus::Created.can_transition(JobStatus::Running));
        assert!(!JobStatus::Queued.can_transition(JobStatus::Completed));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: JobOptions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(options.max_retries, 2);
        assert_eq!(options.retry_delay_ms, None);

        let options: JobOptions =
            serde_json::from_value(json!({"maxRetries": 4, "retryDelayMs": 100})).unwrap();
        assert_eq!(options.max_retries, 4);
        assert_eq!(options.retry_delay_ms, Some(100));
    }

    #[test]
    fn job_serializes_with_wire_names() {
        let job = Job::new("j1".into(), "repomix".into(), json!({"a": 1}), JobOptions::default());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "repomix");
        assert_eq!(value["status"], "created");
        assert!(value.get("createdAt").is_some());
        assert!(value.get("startedAt").is_none());
    }
}
