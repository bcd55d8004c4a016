//! Bounded exponential-backoff retries
//!
//! Attempts are numbered `0..=max_retries`. After a failed attempt the delay is
//! `min(base_delay * backoff_factor^attempt, max_delay)` plus up to 10% random
//! jitter. The error returned once retries stop is exactly the error produced
//! by the last attempt; this module never wraps or converts it.
//!
//! # Example
//!
//! ```
//! use tollgate_core_resilience::backoff::{retry_with_backoff, RetryPolicy};
//! use tollgate_core_resilience::ResilienceError;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<u32, ResilienceError> {
//! let policy = RetryPolicy {
//!     max_retries: 2,
//!     base_delay: Duration::from_millis(50),
//!     ..Default::default()
//! };
//!
//! retry_with_backoff(
//!     || async { Ok::<_, ResilienceError>(7) },
//!     &policy,
//!     |err: &ResilienceError| err.is_transient(),
//! )
//! .await
//! # }
//! ```

use super::error::ResilienceError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Maximum jitter as a fraction of the computed delay
const JITTER_RATIO: f64 = 0.1;

/// Retry tuning for [`retry_with_backoff`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound on the delay before jitter
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Reject options that would make the delay formula meaningless
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ResilienceError::Configuration(format!(
                "backoff_factor must be a finite value >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(ResilienceError::Configuration(format!(
                "base_delay ({:?}) exceeds max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Delay after a failure of `attempt`, before jitter
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.base_delay.as_secs_f64() * 1000.0 * self.backoff_factor.powi(exponent);

        // powi overflows to infinity for large attempts; min() keeps the cap
        Duration::from_secs_f64(delay_ms.min(max_ms).max(0.0) / 1000.0)
    }

    /// Delay after a failure of `attempt`, including jitter of up to 10%
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        let jitter = rand::rng().random_range(0.0..=JITTER_RATIO);
        capped + capped.mul_f64(jitter)
    }

    /// Retry `operation` on every error
    pub async fn run<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        retry_with_backoff(operation, self, |_: &E| true).await
    }
}

/// Run `operation` until it succeeds, attempts run out, or `retry_condition`
/// rejects the latest error.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    mut operation: F,
    policy: &RetryPolicy,
    mut retry_condition: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !retry_condition(&err) {
                    return Err(err);
                }

                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, backing off before retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
