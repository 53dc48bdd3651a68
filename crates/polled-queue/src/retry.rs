//! # Retry Policy Module
//!
//! Bounded retry executor for remote calls. An operation is retried only while
//! its error is classified as transient; any other failure is returned at once.

use crate::error::{QueueError, RemoteError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Classification hook for errors handed to [`RetryPolicy::run`]
pub trait Retryable {
    /// `true` if another attempt may succeed
    fn is_retryable(&self) -> bool;
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        self.is_server_error()
    }
}

impl Retryable for QueueError {
    fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Remote(remote) if remote.is_server_error())
    }
}

/// Retry policy configuration
///
/// # Examples
///
/// ```rust
/// use polled_queue::retry::RetryPolicy;
///
/// // Default policy: 3 attempts, no delay between them
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Pause between attempts in milliseconds
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Pause between attempts
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out
    ///
    /// The last error is returned when every attempt fails. At least one
    /// attempt is always made.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    debug!(attempt = attempt, error = %err, "Transient failure, retrying");
                    attempt += 1;
                    if self.delay_ms > 0 {
                        tokio::time::sleep(self.delay()).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Exponential backoff bounded by a floor and a ceiling
///
/// Attempt `n` (1-based) waits `min * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Delay before retrying after `attempt` failures
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(31);
        let delay = self.min.saturating_mul(1u32 << shift);
        delay.min(self.max.max(self.min))
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
