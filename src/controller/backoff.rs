//! # Exponential Backoff
//!
//! Retry delays that double per attempt up to a cap.
//!
//! Two shapes are provided:
//! - [`ExponentialBackoff::delay_for`] is stateless and keyed by attempt count,
//!   which is what the work queue needs (it tracks attempts per key).
//! - [`BackoffTimer`] carries its own attempt counter for a single retry loop
//!   such as re-establishing a watch stream.
//!
//! ## Usage
//!
//! ```rust
//! use operator_engine::controller::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let backoff = ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(4));
//! assert_eq!(backoff.delay_for(1), Duration::from_millis(500));
//! assert_eq!(backoff.delay_for(2), Duration::from_secs(1));
//! assert_eq!(backoff.delay_for(3), Duration::from_secs(2));
//! assert_eq!(backoff.delay_for(10), Duration::from_secs(4));
//! ```

use std::time::Duration;

/// Exponential backoff policy: `base * 2^(attempt - 1)`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 means "no failure yet".
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // 2^31 * base overflows long before it matters; clamp the exponent.
        let exponent = (attempt - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn timer(&self) -> BackoffTimer {
        BackoffTimer {
            policy: *self,
            attempts: 0,
        }
    }
}

/// Stateful backoff for one retry loop
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    policy: ExponentialBackoff,
    attempts: u32,
}

impl BackoffTimer {
    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.policy.delay_for(self.attempts)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset to the initial state after a success
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
