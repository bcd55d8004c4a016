//! Tollgate Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks Tollgate uses to call upstream
//! services that enforce hard daily quotas, throttle aggressively, or stall
//! during cold starts:
//!
//! - **Circuit Breaker**: Short-circuits to a fallback when an upstream keeps failing
//! - **Quota Limiter**: Per-resource daily usage ceilings with lazy midnight reset
//! - **Degradation Controller**: Shared severity level that picks cheaper variants and serves cached data
//! - **Backoff**: Bounded exponential-backoff retries with jitter
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Network protocols (HTTP, JSON APIs)
//! - Configuration files or environment variables
//! - Application-specific concerns
//!
//! All policies arrive as constructor parameters and all state lives in memory.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast to fallback
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Degradation Controller            │  ← Cheaper variant / cache
//! │  (Normal → Reduced → Minimal → Emerg.)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Quota Limiter                     │  ← Daily ceilings
//! │  (Refuses at 95%, warns at 80%)         │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Backoff                           │  ← Transient failures
//! │  (Exponential delay + 10% jitter)       │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         Upstream Service
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use tollgate_core_resilience::prelude::*;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let breaker = CircuitBreaker::new_default("records-api");
//! let quotas = QuotaLimiter::new([("api_calls", 1000)])?;
//! let degradation = DegradationController::default();
//! let policy = RetryPolicy::default();
//!
//! let (quotas, policy) = (&quotas, &policy);
//! let operations = OperationSet::new("records:all", move || async move {
//!     quotas.check_quota("api_calls")?;
//!     retry_with_backoff(
//!         || async { Ok::<_, ResilienceError>(vec![1, 2, 3]) },
//!         policy,
//!         |err: &ResilienceError| err.is_transient(),
//!     )
//!     .await
//! });
//!
//! let (degradation, operations) = (&degradation, &operations);
//! let rows = breaker
//!     .fire(
//!         move || async move {
//!             let rows = degradation
//!                 .execute_with_degradation(operations, FallbackOptions::emergency(Vec::new()))
//!                 .await?;
//!             Ok(rows.unwrap_or_default())
//!         },
//!         Vec::new,
//!     )
//!     .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod degradation;
pub mod error;
pub mod quota;

// Re-export main types for convenience
pub use backoff::{retry_with_backoff, RetryPolicy};
pub use circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use degradation::{
    DegradationConfig, DegradationController, DegradationLevel, DegradationStatus,
    FallbackOptions, OperationSet,
};
pub use error::{ErrorKind, ResilienceError};
pub use quota::{QuotaCheck, QuotaLevel, QuotaLimiter, QuotaUsage};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use tollgate_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::{retry_with_backoff, RetryPolicy};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::degradation::{
        DegradationController, DegradationLevel, FallbackOptions, OperationSet,
    };
    pub use super::error::{ErrorKind, ResilienceError};
    pub use super::quota::{QuotaLimiter, QuotaLevel};
}
