//! Consecutive-failure circuit breaker.
//!
//! Closed → Open when transient failures reach the threshold. Open rejects
//! calls until the cool-down ends; the first call after that closes the
//! circuit again and starts counting from zero.

use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Longest cool-down the breaker will honour.
pub const MAX_OPEN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub consecutive_errors: u32,
    pub open_until: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    threshold: u32,
    open_for: Duration,
    consecutive_errors: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    /// `open_for` is clamped to [`MAX_OPEN_DURATION`].
    pub(crate) fn new(threshold: u32, open_for: Duration) -> Self {
        Self {
            threshold,
            open_for: open_for.min(MAX_OPEN_DURATION),
            consecutive_errors: 0,
            open_until: None,
        }
    }

    /// `Err(remaining)` while open.
    pub(crate) fn check(&mut self, now: Instant) -> Result<(), Duration> {
        match self.open_until {
            Some(until) if until > now => Err(until - now),
            Some(_) => {
                info!(
                    consecutive_errors = self.consecutive_errors,
                    "Circuit breaker cool-down elapsed, closing"
                );
                self.open_until = None;
                self.consecutive_errors = 0;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_errors = 0;
        self.open_until = None;
    }

    /// Returns true when this failure opened the circuit.
    pub(crate) fn record_transient(&mut self, now: Instant) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.threshold == 0 || self.consecutive_errors < self.threshold {
            return false;
        }
        self.open_until = Some(now.checked_add(self.open_for).unwrap_or(now + MAX_OPEN_DURATION));
        warn!(
            consecutive_errors = self.consecutive_errors,
            open_for_secs = self.open_for.as_secs(),
            "Circuit breaker opened"
        );
        true
    }

    pub(crate) fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            consecutive_errors: self.consecutive_errors,
            open_until: self.open_until,
        }
    }
}
