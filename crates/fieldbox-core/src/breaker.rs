//! Circuit breaker gating uploads after repeated transport failures.
//!
//! The breaker is a consecutive-failure counter with a cool-down, owned
//! by the coordinator and never persisted. It opens once the counter
//! reaches the threshold and closes silently when the cool-down since
//! the last failure has elapsed; a single successful group upload
//! clears it regardless of the prior count.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

/// Consecutive breaker-counted failures before the circuit opens.
pub const CIRCUIT_THRESHOLD: u32 = 10;
/// Cool-down after the last failure before the circuit closes again.
pub const CIRCUIT_RESET: Duration = Duration::from_secs(3600);

/// Configuration for the upload circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cool-down after which an open circuit closes on its own.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: CIRCUIT_THRESHOLD,
            reset_timeout: CIRCUIT_RESET,
        }
    }
}

/// Snapshot of breaker state for status reporting. An open breaker is
/// surfaced to users as "sync paused", not as an error.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub open: bool,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub cooldown_remaining_ms: Option<u64>,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            last_failure_at: None,
        }
    }

    /// Record a failure that counts toward the breaker.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(Instant::now());
        if self.consecutive_failures == self.config.failure_threshold {
            warn!(
                failures = self.consecutive_failures,
                "circuit opened; pausing uploads"
            );
        }
    }

    /// Record a successful group upload: the counter clears fully.
    pub fn record_success(&mut self) {
        if self.consecutive_failures >= self.config.failure_threshold {
            info!("circuit closed after successful upload");
        }
        self.consecutive_failures = 0;
        self.last_failure_at = None;
    }

    /// Whether uploads are currently gated.
    ///
    /// Auto-closes (and clears the counter) once the cool-down since
    /// the last failure has elapsed.
    pub fn is_open(&mut self) -> bool {
        if self.consecutive_failures < self.config.failure_threshold {
            return false;
        }
        let elapsed = self
            .last_failure_at
            .map_or(self.config.reset_timeout, |t| t.elapsed());
        if elapsed >= self.config.reset_timeout {
            info!("circuit cool-down elapsed; resuming uploads");
            self.consecutive_failures = 0;
            self.last_failure_at = None;
            return false;
        }
        true
    }

    /// Non-mutating snapshot for reporting.
    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        let open = self.consecutive_failures >= self.config.failure_threshold
            && self
                .last_failure_at
                .is_some_and(|t| t.elapsed() < self.config.reset_timeout);
        let remaining = if open {
            self.last_failure_at
                .and_then(|t| self.config.reset_timeout.checked_sub(t.elapsed()))
        } else {
            None
        };
        CircuitBreakerStatus {
            open,
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            cooldown_remaining_ms: remaining.map(|d| d.as_millis() as u64),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
