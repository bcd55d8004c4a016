/*!
 * Error types for Tollgate
 */

use std::io;
use thiserror::Error;
use tollgate_core_resilience::ResilienceError;

pub type Result<T> = std::result::Result<T, TollgateError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum TollgateError {
    /// I/O error reading or writing configuration
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Configuration values are invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream base URL is malformed
    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Output could not be encoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure surfaced by the resilience pipeline
    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl TollgateError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TollgateError::Io(_)
            | TollgateError::ConfigParse(_)
            | TollgateError::ConfigSerialize(_)
            | TollgateError::Config(_)
            | TollgateError::InvalidUrl(_)
            | TollgateError::Http(_) => EXIT_FATAL,
            TollgateError::Resilience(err) if err.is_fatal() => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// Check if this error is fatal (should not retry)
    pub fn is_fatal(&self) -> bool {
        self.exit_code() == EXIT_FATAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_config_errors_are_fatal() {
        let err = TollgateError::Config("missing base_url".to_string());
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), EXIT_FATAL);
        assert_eq!(err.to_string(), "Configuration error: missing base_url");
    }

    #[test]
    fn test_resilience_errors_keep_their_message() {
        let err: TollgateError = ResilienceError::Timeout(Duration::from_secs(30)).into();
        assert_eq!(err.to_string(), "Operation timeout after 30s");
        assert_eq!(err.exit_code(), EXIT_PARTIAL);
    }

    #[test]
    fn test_resilience_configuration_error_is_fatal() {
        let err: TollgateError =
            ResilienceError::Configuration("unknown quota resource 'x'".to_string()).into();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "tollgate.toml");
        let err: TollgateError = io_err.into();
        assert!(matches!(err, TollgateError::Io(_)));
        assert_eq!(err.exit_code(), EXIT_FATAL);
    }
}
