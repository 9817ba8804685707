//! Bounded retry with capped exponential backoff.
//!
//! Wraps only the primary-provider call. Retry policy lives on the error type:
//! [`AppError::is_retryable`] marks upstream 5xx and transport failures, and
//! everything else surfaces after exactly one attempt.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::core::config::TimeoutConfig;
use crate::core::error::Result;

/// Longest single backoff sleep.
const MAX_BACKOFF_MS: u64 = 10_000;

/// Backoff growth factor per retry.
const BACKOFF_FACTOR: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retry_time_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retry_count: u32,
}

impl RetryPolicy {
    pub fn from_config(timeouts: &TimeoutConfig) -> Self {
        Self {
            enabled: timeouts.enable_retry,
            max_retry_time_ms: timeouts.max_retry_time_ms,
            retry_delay_ms: timeouts.retry_delay_ms,
            max_retry_count: timeouts.max_retry_count,
        }
    }

    /// Delay before retry number `n` (0-based): `delay × 1.5^n`, capped.
    fn backoff_delay_ms(&self, retry_index: u32) -> u64 {
        let delay = self.retry_delay_ms as f64 * BACKOFF_FACTOR.powi(retry_index as i32);
        delay.min(MAX_BACKOFF_MS as f64) as u64
    }

    /// Run `attempt` until it succeeds or the retry budget is spent.
    ///
    /// The error returned is always the last real failure; no synthetic
    /// timeout error replaces what the provider actually said.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut retries: u32 = 0;

        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.enabled || !err.is_retryable() {
                        return Err(err);
                    }

                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    if retries >= self.max_retry_count
                        || elapsed_ms + self.retry_delay_ms >= self.max_retry_time_ms
                    {
                        return Err(err);
                    }

                    let delay = self.backoff_delay_ms(retries);
                    retries += 1;
                    tracing::warn!(
                        retry = retries,
                        delay_ms = delay,
                        error = %err,
                        "Primary provider call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }
}
