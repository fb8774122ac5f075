//! Telemetry capability.
//!
//! Components report noteworthy conditions (circuit transitions, retry
//! exhaustion, rollback failures) through the [`Telemetry`] trait. The
//! default implementation forwards to `tracing`; tests substitute
//! [`RecordingTelemetry`] to assert on emitted records.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryRecord {
    pub severity: Severity,
    pub component: String,
    pub message: String,
    pub details: Option<Value>,
    pub at: DateTime<Utc>,
}

impl TelemetryRecord {
    pub fn new(severity: Severity, component: &str, message: &str) -> Self {
        Self {
            severity,
            component: component.to_string(),
            message: message.to_string(),
            details: None,
            at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub trait Telemetry: Send + Sync {
    fn record(&self, record: TelemetryRecord);

    fn info(&self, component: &str, message: &str) {
        self.record(TelemetryRecord::new(Severity::Info, component, message));
    }

    fn warning(&self, component: &str, message: &str) {
        self.record(TelemetryRecord::new(Severity::Warning, component, message));
    }

    fn error(&self, component: &str, message: &str) {
        self.record(TelemetryRecord::new(Severity::Error, component, message));
    }

    fn critical(&self, component: &str, message: &str) {
        self.record(TelemetryRecord::new(Severity::Critical, component, message));
    }
}

/// Forwards telemetry records to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn record(&self, record: TelemetryRecord) {
        match record.severity {
            Severity::Info => {
                tracing::info!(component = %record.component, "{}", record.message)
            }
            Severity::Warning => {
                tracing::warn!(component = %record.component, "{}", record.message)
            }
            Severity::Error | Severity::Critical => {
                tracing::error!(component = %record.component, "{}", record.message)
            }
        }
    }
}

/// Captures records in memory. Test support.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().expect("telemetry lock poisoned").clone()
    }

    pub fn messages_with_severity(&self, severity: Severity) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.severity == severity)
            .map(|r| r.message)
            .collect()
    }
}

impl Telemetry for RecordingTelemetry {
    fn record(&self, record: TelemetryRecord) {
        self.records
            .lock()
            .expect("telemetry lock poisoned")
            .push(record);
    }
}
