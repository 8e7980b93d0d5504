//! Retry schedules for failed job attempts.
//!
//! Attempts are 1-indexed. After attempt `k` fails with a retryable error,
//! retry number `n = k - 1` is scheduled if `k <= max_retries`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::JobDescriptor;

/// How the delay grows between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `base * 2^n`.
    Exponential {
        /// Delay before the first retry.
        #[serde(with = "humantime_serde")]
        base: Duration,
    },
    /// `step * (n + 1)`.
    Linear {
        /// Increment per retry.
        #[serde(with = "humantime_serde")]
        step: Duration,
    },
}

/// Retry budget and backoff for one kind of job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay schedule.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Single predictions: 3 retries at 30s, 60s, 120s.
    #[must_use]
    pub const fn single() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(30),
            },
        }
    }

    /// Batch predictions: 2 retries at 60s, 120s.
    #[must_use]
    pub const fn batch() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::Linear {
                step: Duration::from_secs(60),
            },
        }
    }

    /// Policy for a job's mode.
    #[must_use]
    pub const fn for_job(job: &JobDescriptor) -> Self {
        if job.is_batch() {
            Self::batch()
        } else {
            Self::single()
        }
    }

    /// Returns true if a failure of `attempt` may be retried.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_retries
    }

    /// Delay before the attempt following a failed `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.saturating_sub(1);
        match self.backoff {
            Backoff::Exponential { base } => {
                base.saturating_mul(2u32.checked_pow(n).unwrap_or(u32::MAX))
            }
            Backoff::Linear { step } => step.saturating_mul(n.saturating_add(1)),
        }
    }
}
