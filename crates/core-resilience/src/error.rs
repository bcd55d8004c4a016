//! Error types for the resilience primitives
//!
//! Every failure carries an [`ErrorKind`] tag set where the failure happens.
//! Retry and fallback decisions match on the kind, never on message text.

use std::time::Duration;
use thiserror::Error;

/// Classification of a failure, used by every resilience layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection failure or 5xx from an upstream
    Transient,
    /// The upstream did not answer within the call deadline
    Timeout,
    /// The upstream is rate limiting us (HTTP 429)
    Throttled,
    /// The upstream reported itself unavailable (HTTP 503, cold start)
    Unavailable,
    /// A metered resource is at or above its critical threshold
    QuotaExhausted,
    /// Unknown resource or malformed options
    Configuration,
    /// The upstream rejected the request itself
    Permanent,
    /// Circuit breaker refused the call
    CircuitOpen,
}

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Transient upstream failure that may be retried
    #[error("Transient upstream error: {0}")]
    Transient(String),

    /// Timeout occurred
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// Upstream rate limit hit
    #[error("Rate limit exceeded: {0}")]
    Throttled(String),

    /// Upstream temporarily unavailable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Daily quota exhausted for a metered resource
    #[error("Quota exceeded for {resource}: {used}/{limit}")]
    QuotaExhausted {
        resource: String,
        used: u64,
        limit: u64,
    },

    /// Configuration problem, fatal to the call
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,
}

impl ResilienceError {
    /// The typed classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::Transient(_) => ErrorKind::Transient,
            ResilienceError::Timeout(_) => ErrorKind::Timeout,
            ResilienceError::Throttled(_) => ErrorKind::Throttled,
            ResilienceError::Unavailable(_) => ErrorKind::Unavailable,
            ResilienceError::QuotaExhausted { .. } => ErrorKind::QuotaExhausted,
            ResilienceError::Configuration(_) => ErrorKind::Configuration,
            ResilienceError::Permanent(_) => ErrorKind::Permanent,
            ResilienceError::CircuitOpen => ErrorKind::CircuitOpen,
        }
    }

    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::Throttled | ErrorKind::Unavailable
        )
    }

    /// Check if the circuit breaker may mask this error with a fallback value
    pub fn is_fallback_eligible(&self) -> bool {
        self.is_transient() || self.kind() == ErrorKind::QuotaExhausted
    }

    /// Check if this error signals quota exhaustion
    pub fn is_quota(&self) -> bool {
        self.kind() == ErrorKind::QuotaExhausted
    }

    /// Check if this error must reach the caller unmasked
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}
