//! Failure values crossing the handler boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured failure returned by job handlers. Carries the optional code
/// and HTTP status the classifier keys on.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub code: Option<String>,
    pub http_status: Option<u16>,
    pub stack: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            http_status: None,
            stack: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::new(message)
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            http_status: Some(status),
            ..Self::new(message)
        }
    }

    pub fn timed_out(budget_ms: u64) -> Self {
        Self::with_code(format!("job timed out after {budget_ms}ms"), "timed-out")
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::NotFound => Some("file-not-found"),
            ErrorKind::PermissionDenied => Some("permission-denied"),
            ErrorKind::AlreadyExists => Some("exists"),
            ErrorKind::InvalidInput => Some("invalid-argument"),
            ErrorKind::ConnectionRefused => Some("connection-refused"),
            ErrorKind::ConnectionReset => Some("connection-reset"),
            ErrorKind::BrokenPipe => Some("broken-pipe"),
            ErrorKind::TimedOut => Some("timed-out"),
            ErrorKind::WouldBlock => Some("try-again"),
            _ => None,
        };
        Self {
            message: err.to_string(),
            code: code.map(|c| c.to_string()),
            http_status: None,
            stack: None,
        }
    }
}

impl From<reqwest::Error> for HandlerError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            Some("timed-out".to_string())
        } else if err.is_connect() {
            Some("connection-refused".to_string())
        } else {
            None
        };
        Self {
            message: err.to_string(),
            code,
            http_status: err.status().map(|s| s.as_u16()),
            stack: None,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: format!("{err:#}"),
            code: None,
            http_status: None,
            stack: Some(format!("{err:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    #[serde(rename = "retryable")]
    Retryable,
    #[serde(rename = "non-retryable")]
    NonRetryable,
}

/// Structured error materialized on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub category: ErrorCategory,
    pub retryable: bool,
    pub suggested_delay_ms: u64,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub circuit_breaker_tripped: bool,
}
