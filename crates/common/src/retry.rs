//! Retry policy shared by the job queue and the delivery ledger.
//!
//! The queue needs `attempts` + `backoff` when a job is enqueued, and the
//! delivery worker needs to know when a failure is the last allowed attempt.
//! Both are derived from the same `RetryPolicy` so they cannot drift apart.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Total attempts per delivery when nothing else is configured.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base backoff delay when nothing else is configured.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(2000);

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
}

/// What to do with a delivery after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Record the failure (`retry_count + 1`) and let the queue redeliver.
    Retry,
    /// This was the last allowed attempt.
    Exhausted,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Result<Self, AppError> {
        if max_attempts == 0 {
            return Err(AppError::Config(
                "DELIVERY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            backoff_base,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    /// Highest `retry_count` a delivery can carry (`max_attempts - 1`).
    pub fn max_retry_count(&self) -> i32 {
        (self.max_attempts - 1) as i32
    }

    /// Decide the ledger outcome of a failed attempt given the delivery's
    /// current retry counter.
    pub fn on_failure(&self, retry_count: i32) -> FailureDecision {
        if retry_count >= self.max_retry_count() {
            FailureDecision::Exhausted
        } else {
            FailureDecision::Retry
        }
    }

    /// Delay before redelivering a job that has failed `attempts_made` times.
    ///
    /// `delay = base * 2^(attempts_made - 1)`, so with a 2s base the first
    /// retry waits 2s, the second 4s.
    pub fn backoff_delay(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1u32 << exponent)
    }

    /// Job options submitted with every delivery job.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.max_attempts,
            backoff: Backoff {
                kind: BackoffKind::Exponential,
                delay: self.backoff_base.as_millis() as u64,
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

/// Per-job retry options, serialized as
/// `{ "attempts": 3, "backoff": { "type": "exponential", "delay": 2000 } }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub delay: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl JobOptions {
    /// Delay before redelivering after `attempts_made` failed attempts.
    pub fn backoff_delay(&self, attempts_made: u32) -> Duration {
        let base = Duration::from_millis(self.backoff.delay);
        match self.backoff.kind {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << exponent)
            }
        }
    }
}
