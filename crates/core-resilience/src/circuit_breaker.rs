//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by short-circuiting to a
//! fallback when an upstream keeps failing. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Upstream is unhealthy, the fallback is served without calling it
//! - HalfOpen: Testing if the upstream has recovered
//!
//! ```text
//! Closed   → Open:     failure_threshold consecutive failures
//! Open     → HalfOpen: reset_timeout elapsed since the last failure
//! HalfOpen → Closed:   success_threshold consecutive successes
//! HalfOpen → Open:     any failure (restarts the reset_timeout clock)
//! ```
//!
//! State checks and updates each take the breaker's lock, but the lock is
//! never held while the operation runs. Calls already in flight when the
//! circuit opens still complete and record their outcome.

use super::error::ResilienceError;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests are answered by the fallback
    Open,
    /// Circuit is half-open, testing upstream recovery
    HalfOpen,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Time since the last failure before an open circuit lets a trial call through
    pub reset_timeout: Duration,
    /// Number of consecutive successes in half-open to close circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(ResilienceError::Configuration(
                "circuit breaker thresholds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
    total_fallbacks: u64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_failure: None,
            total_requests: 0,
            total_failures: 0,
            total_fallbacks: 0,
        }
    }
}

/// Observability snapshot of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_fallbacks: u64,
    /// Percentage of requests that did not fail; 100 before any request
    pub success_rate: f64,
    /// Percentage of requests answered by the fallback
    pub fallback_rate: f64,
}

fn percentage(part: u64, whole: u64) -> f64 {
    (part as f64 / whole as f64 * 10_000.0).round() / 100.0
}

/// What admission decided for a request
enum Admission {
    Proceed,
    Rejected,
}

/// Circuit breaker for protecting against cascading failures
///
/// # Example
/// ```no_run
/// use tollgate_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new("records-api", CircuitBreakerConfig::default());
///
///     // Timeouts, throttling and quota errors are answered by the fallback
///     let rows: Vec<String> = breaker
///         .fire(|| async { Ok(vec!["row".to_string()]) }, Vec::new)
///         .await?;
///
///     println!("{} rows", rows.len());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state of the circuit breaker
    pub async fn get_state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Snapshot of the state and counters
    pub async fn stats(&self) -> BreakerStats {
        let state = self.state.lock().await;
        let (success_rate, fallback_rate) = if state.total_requests == 0 {
            (100.0, 0.0)
        } else {
            (
                percentage(
                    state.total_requests.saturating_sub(state.total_failures),
                    state.total_requests,
                ),
                percentage(state.total_fallbacks, state.total_requests),
            )
        };

        BreakerStats {
            state: state.state,
            failure_count: state.consecutive_failures,
            total_requests: state.total_requests,
            total_failures: state.total_failures,
            total_fallbacks: state.total_fallbacks,
            success_rate,
            fallback_rate,
        }
    }

    /// Reset the circuit breaker to closed state with every counter zeroed
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = CircuitBreakerState::new();
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    /// Execute an operation, answering with `fallback` when the circuit is
    /// open or the operation fails with a fallback-eligible error
    ///
    /// Other errors are returned unchanged.
    pub async fn fire<F, Fut, T, FB>(&self, op: F, fallback: FB) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
        FB: FnOnce() -> T,
    {
        if let Admission::Rejected = self.admit(true).await {
            return Ok(fallback());
        }

        match op().await {
            Ok(result) => {
                self.on_success().await;
                Ok(result)
            }
            Err(e) => {
                if self.on_failure(&e, true).await {
                    Ok(fallback())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Execute an operation without a fallback
    ///
    /// Fails fast with [`ResilienceError::CircuitOpen`] while the circuit is
    /// open; every operation error is returned unchanged.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        if let Admission::Rejected = self.admit(false).await {
            return Err(ResilienceError::CircuitOpen);
        }

        match op().await {
            Ok(result) => {
                self.on_success().await;
                Ok(result)
            }
            Err(e) => {
                self.on_failure(&e, false).await;
                Err(e)
            }
        }
    }

    /// Count the request and decide whether the operation may run
    async fn admit(&self, with_fallback: bool) -> Admission {
        let mut state = self.state.lock().await;
        state.total_requests += 1;

        if state.state != CircuitState::Open {
            return Admission::Proceed;
        }

        let cooled_down = state
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.config.reset_timeout);

        if cooled_down {
            // Transition to half-open for testing
            state.state = CircuitState::HalfOpen;
            state.half_open_successes = 0;
            tracing::info!(breaker = %self.name, "Circuit half-open, probing upstream");
            Admission::Proceed
        } else {
            if with_fallback {
                state.total_fallbacks += 1;
            }
            Admission::Rejected
        }
    }

    /// Handle successful operation
    async fn on_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;

        if state.state == CircuitState::HalfOpen {
            state.half_open_successes += 1;

            // If enough successes, close the circuit
            if state.half_open_successes >= self.config.success_threshold {
                state.state = CircuitState::Closed;
                state.half_open_successes = 0;
                tracing::info!(breaker = %self.name, "Circuit closed, upstream recovered");
            }
        }
    }

    /// Handle failed operation. Returns true when the fallback answers it.
    async fn on_failure(&self, error: &ResilienceError, with_fallback: bool) -> bool {
        let mut state = self.state.lock().await;

        state.consecutive_failures += 1;
        state.total_failures += 1;
        state.last_failure = Some(Instant::now());

        let reopen = state.state == CircuitState::HalfOpen;
        let trip = state.state == CircuitState::Closed
            && state.consecutive_failures >= self.config.failure_threshold;

        if reopen || trip {
            state.state = CircuitState::Open;
            state.half_open_successes = 0;
            tracing::warn!(
                breaker = %self.name,
                failures = state.consecutive_failures,
                error = %error,
                "Circuit opened"
            );
        }

        let use_fallback = with_fallback && error.is_fallback_eligible();
        if use_fallback {
            state.total_fallbacks += 1;
            tracing::debug!(breaker = %self.name, error = %error, "Serving fallback");
        }
        use_fallback
    }
}
