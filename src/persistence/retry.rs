//! Bounded retry with exponential backoff for store calls.
//!
//! Only [`AppError::Unavailable`] is retried; every other error is returned
//! on the first attempt. Exhausting the budget yields `Unavailable`, which the
//! API reports as a retryable server error.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::StoreConfig;
use crate::{AppError, Result};

/// Retry budget applied to every store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling for a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for RetryPolicy {
    fn from(config: &StoreConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Run `call` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or `AppError::Unavailable` once
    /// all attempts failed transiently.
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match call().await {
                Err(AppError::Unavailable(msg)) if attempt < self.max_attempts => {
                    warn!(op, attempt, error = %msg, delay = ?backoff, "store call failed; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                    attempt += 1;
                }
                Err(AppError::Unavailable(msg)) => {
                    return Err(AppError::Unavailable(format!(
                        "{op} failed after {attempt} attempts: {msg}"
                    )));
                }
                other => return other,
            }
        }
    }
}
