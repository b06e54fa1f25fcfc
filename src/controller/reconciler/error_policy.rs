//! # Error Policy
//!
//! Maps the result of one reconcile run to what the driver does with the key.
//!
//! | Result                           | Outcome                                     |
//! |----------------------------------|---------------------------------------------|
//! | `Ok(action)`                     | `Success`: forget failures, optional recheck |
//! | conflict / transient / panic     | `Retry` with backoff, `RetriesExhausted` once the budget is spent |
//! | terminal / invalid               | `Terminal`: surface on status, forget       |
//! | `NotLeader`                      | `Deferred`: re-add without counting a failure |
//!
//! Kept free of I/O so the decision table can be tested on its own.

use super::types::{Action, ErrorClass, ReconcileError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success { requeue_after: Option<Duration> },
    Retry,
    RetriesExhausted,
    Terminal,
    Deferred,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Retry => "retry",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Terminal => "terminal",
            Self::Deferred => "deferred",
        }
    }
}

/// Decide the fate of a key.
///
/// `failures` is the number of failed runs already recorded for the key
/// (not counting this one). With `max_retries = n` a key runs at most `n + 1`
/// times in a row before its error is surfaced.
pub fn decide(result: &Result<Action, ReconcileError>, failures: u32, max_retries: u32) -> Outcome {
    let err = match result {
        Ok(action) => {
            return Outcome::Success {
                requeue_after: action.requeue_after(),
            }
        }
        Err(err) => err,
    };

    match err.class() {
        ErrorClass::NotLeader => Outcome::Deferred,
        ErrorClass::Terminal => Outcome::Terminal,
        ErrorClass::Conflict | ErrorClass::Transient | ErrorClass::Panicked => {
            if failures >= max_retries {
                Outcome::RetriesExhausted
            } else {
                Outcome::Retry
            }
        }
    }
}
