//! Error classifier.
//!
//! Pure function deciding retryable vs terminal from error codes, HTTP
//! status, and message patterns. Must run before any retry decision.
//!
//! Unrecognized errors default to retryable so transient failures with an
//! unknown cause are not discarded. See the retry table for the caps that
//! keep this from looping forever.

use super::error::{ErrorCategory, HandlerError, JobErrorInfo};

pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;

const NON_RETRYABLE_CODES: &[&str] = &[
    "file-not-found",
    "not-a-directory",
    "is-a-directory",
    "permission-denied",
    "not-permitted",
    "invalid-argument",
    "exists",
    "dns-not-found",
    "connection-refused",
    "module-not-found",
];

/// Retryable codes with their suggested delay in milliseconds.
const RETRYABLE_CODES: &[(&str, u64)] = &[
    ("timed-out", 5000),
    ("connection-reset", 3000),
    ("host-unreachable", 5000),
    ("network-unreachable", 5000),
    ("broken-pipe", 5000),
    ("try-again", 5000),
    ("resource-busy", 2000),
];

const RETRYABLE_PATTERNS: &[&str] = &["timeout", "rate limit", "temporarily unavailable"];

pub fn classify(error: &HandlerError) -> JobErrorInfo {
    if let Some(code) = error.code.as_deref() {
        if NON_RETRYABLE_CODES.contains(&code) {
            return build(error, false, 0, "non-retryable-code");
        }
        if let Some((_, delay)) = RETRYABLE_CODES.iter().find(|(c, _)| *c == code) {
            return build(error, true, *delay, "retryable-code");
        }
    }

    if let Some(status) = error.http_status {
        if status == 429 {
            return build(error, true, 60_000, "http-429");
        }
        if (500..=599).contains(&status) {
            return build(error, true, 10_000, "http-5xx");
        }
        if (400..=499).contains(&status) {
            return build(error, false, 0, "http-4xx");
        }
    }

    let message = error.message.to_lowercase();
    if RETRYABLE_PATTERNS.iter().any(|p| message.contains(p)) {
        return build(error, true, DEFAULT_RETRY_DELAY_MS, "message-pattern");
    }

    build(error, true, DEFAULT_RETRY_DELAY_MS, "unrecognized")
}

fn build(error: &HandlerError, retryable: bool, delay_ms: u64, reason: &str) -> JobErrorInfo {
    JobErrorInfo {
        message: error.message.clone(),
        code: error.code.clone(),
        http_status: error.http_status,
        category: if retryable {
            ErrorCategory::Retryable
        } else {
            ErrorCategory::NonRetryable
        },
        retryable,
        suggested_delay_ms: delay_ms,
        reason: reason.to_string(),
        stack: error.stack.clone(),
        circuit_breaker_tripped: false,
    }
}
