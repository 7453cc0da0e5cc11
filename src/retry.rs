//! Bounded retry with exponential backoff.
//!
//! Bus publishes and store operations are retried a fixed number of times and then
//! surfaced to the caller; nothing is retried forever.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy shared by publish and store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> usize {
    5
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Operation gave up; carries the attempt count and the last error.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: usize,
    pub last_error: E,
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Backoff before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn delay_for(&self, retry: usize) -> Duration {
        let shift = retry.saturating_sub(1).min(16) as u32;
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Run a blocking operation under this policy.
    ///
    /// Only errors for which `is_retryable` returns true are retried; anything else
    /// is returned immediately as exhausted after the current attempt.
    pub fn run_blocking<T, E, F, R>(
        &self,
        operation: &str,
        is_retryable: R,
        mut op: F,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Result<T, E>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max = self.attempts();
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max && is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(operation, attempt, max_attempts = max, error = %e, "Retrying after failure");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    debug!(operation, attempt, "Giving up");
                    return Err(Exhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
            }
        }
    }

    /// Async counterpart of [`RetryPolicy::run_blocking`].
    pub async fn run_async<T, E, F, Fut, R>(
        &self,
        operation: &str,
        is_retryable: R,
        mut op: F,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max = self.attempts();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max && is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(operation, attempt, max_attempts = max, error = %e, "Retrying after failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(operation, attempt, "Giving up");
                    return Err(Exhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
            }
        }
    }
}
