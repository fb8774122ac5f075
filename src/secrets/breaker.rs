//! Three-state circuit breaker guarding the live secrets fetch.
//!
//! State machine: closed -> open -> half-open -> closed. The first open
//! interval uses the configured timeout; a failed half-open probe reopens
//! with exponential backoff capped at `max_backoff`.

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "halfOpen")]
    HalfOpen,
}

/// Breaker transition worth reporting to telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    Closed,
    Reopened,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(5000),
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u64,
    total_failures: u64,
    opened_at: Option<Instant>,
    open_for: Duration,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            total_failures: 0,
            opened_at: None,
            open_for: Duration::ZERO,
        }
    }

    /// Whether a live call may be attempted right now. Transitions an
    /// expired open interval to half-open as a side effect.
    pub fn should_attempt(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = self
                    .opened_at
                    .map(|at| now.duration_since(at) >= self.open_for)
                    .unwrap_or(true);
                if expired {
                    self.state = CircuitState::HalfOpen;
                    self.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) -> Option<Transition> {
        self.total_requests += 1;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    self.opened_at = None;
                    Some(Transition::Closed)
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    pub fn on_failure(&mut self, now: Instant) -> Option<Transition> {
        self.total_requests += 1;
        self.total_failures += 1;
        self.consecutive_failures += 1;
        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open(now, self.config.timeout);
                    Some(Transition::Opened)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.open(now, self.backoff_interval());
                Some(Transition::Reopened)
            }
            CircuitState::Open => None,
        }
    }

    fn open(&mut self, now: Instant, interval: Duration) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.open_for = interval;
        self.consecutive_successes = 0;
    }

    fn backoff_interval(&self) -> Duration {
        let exp = self
            .config
            .multiplier
            .powi(self.consecutive_failures.min(32) as i32);
        let millis = (self.config.base_delay.as_millis() as f64 * exp)
            .min(self.config.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        (self.total_requests - self.total_failures) as f64 / self.total_requests as f64
    }

    pub fn next_attempt_in(&self, now: Instant) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let at = self.opened_at?;
        let elapsed = now.duration_since(at);
        Some(self.open_for.saturating_sub(elapsed))
    }
}
