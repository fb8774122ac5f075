//! Job server event stream.
//!
//! Events carry a snapshot of the job at emission time; consumers must not
//! treat it as live state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "job:created")]
    JobCreated,
    #[serde(rename = "job:queued")]
    JobQueued,
    #[serde(rename = "job:started")]
    JobStarted,
    #[serde(rename = "job:progress")]
    JobProgress,
    #[serde(rename = "job:completed")]
    JobCompleted,
    #[serde(rename = "job:failed")]
    JobFailed,
    #[serde(rename = "queue:drained")]
    QueueDrained,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobCreated => "job:created",
            EventKind::JobQueued => "job:queued",
            EventKind::JobStarted => "job:started",
            EventKind::JobProgress => "job:progress",
            EventKind::JobCompleted => "job:completed",
            EventKind::JobFailed => "job:failed",
            EventKind::QueueDrained => "queue:drained",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_scheduled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl JobEvent {
    pub fn for_job(kind: EventKind, job: &Job) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            job: Some(job.clone()),
            progress: None,
            retry_scheduled: None,
            attempts: None,
        }
    }

    pub fn progress(job: &Job, progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Self::for_job(EventKind::JobProgress, job)
        }
    }

    pub fn failed(job: &Job, retry_scheduled: bool, attempts: u32) -> Self {
        Self {
            retry_scheduled: Some(retry_scheduled),
            attempts: Some(attempts),
            ..Self::for_job(EventKind::JobFailed, job)
        }
    }

    pub fn drained() -> Self {
        Self {
            kind: EventKind::QueueDrained,
            timestamp: Utc::now(),
            job: None,
            progress: None,
            retry_scheduled: None,
            attempts: None,
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job.as_ref().map(|job| job.id.as_str())
    }
}

/// Broadcast fan-out for job events. Slow subscribers lag rather than
/// block the dispatcher.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: JobEvent) {
        // Send only fails when there are no subscribers, which is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{Job, JobOptions};
    use serde_json::json;

    #[test]
    fn event_envelope_wire_shape() {
        let job = Job::new("j1".into(), "repomix".into(), json!({}), JobOptions::default());
        let event = JobEvent::failed(&job, true, 1);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "job:failed");
        assert_eq!(value["retryScheduled"], true);
        assert_eq!(value["attempts"], 1);
        assert_eq!(value["job"]["id"], "j1");
        assert!(value.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let job = Job::new("j1".into(), "repomix".into(), json!({}), JobOptions::default());
        bus.emit(JobEvent::for_job(EventKind::JobCreated, &job));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::JobCreated);
        assert_eq!(event.job_id(), Some("j1"));
    }
}
