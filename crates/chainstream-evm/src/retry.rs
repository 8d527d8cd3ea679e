//! Exponential backoff for RPC calls, queue sends and drain triggers.
//!
//! Only errors for which [`StreamError::is_retryable`] holds are retried
//! in place. Everything else, a lost pointer CAS included, goes straight
//! back to the caller so the tick can decide.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use chainstream_core::error::StreamError;

/// Backoff settings shared by every retried call of one component.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A policy that gives up after the first failure.
    pub fn none() -> Self {
        Self::new(RetryConfig {
            max_retries: 0,
            ..Default::default()
        })
    }

    /// Delay before retry number `retry` (1-based), `None` once retries are used up.
    pub fn next_delay(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.config.max_retries {
            return None;
        }
        let factor = self.config.multiplier.max(1.0).powi(retry as i32 - 1);
        let delay = self.config.initial_backoff.mul_f64(factor);
        Some(delay.min(self.config.max_backoff))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy gives up. `what` names the operation in logs.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, StreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StreamError>>,
{
    let mut failures = 0u32;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !err.is_retryable() {
            return Err(err);
        }
        failures += 1;
        let Some(delay) = policy.next_delay(failures) else {
            return Err(err);
        };
        warn!(failures, delay_ms = delay.as_millis() as u64, error = %err, what, "retrying");
        tokio::time::sleep(delay).await;
    }
}
