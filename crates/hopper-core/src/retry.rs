//! Retry policy with capped exponential backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How failed jobs are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt (0 = fail on first error)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_backoff: Duration::from_secs(15),
            max_backoff: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// `min(base * 2^retry_count, max_backoff)`, where `retry_count` is the
    /// number of retries already consumed.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.base_backoff.checked_mul(factor))
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}
