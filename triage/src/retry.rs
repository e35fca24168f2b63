//! Retry policy for stage capability calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for timeouts and transient provider failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (1-indexed; 0 means the first call).
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        if retry == 0 {
            return 0;
        }
        let delay = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(retry as i32 - 1);
        (delay as u64).min(self.max_backoff_ms)
    }

    pub fn backoff_duration(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(retry))
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Total calls a single invocation may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    /// 3 retries, 200ms initial backoff, 2x multiplier, 5s cap.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}
