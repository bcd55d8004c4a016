/*!
 * Configuration types for Tollgate
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tollgate_core_resilience::{CircuitBreakerConfig, DegradationConfig, RetryPolicy};

use crate::error::{Result, TollgateError};

/// Environment variable overriding `upstream.api_key`
pub const ENV_API_KEY: &str = "TOLLGATE_API_KEY";

/// Environment variable overriding `upstream.base_url`
pub const ENV_BASE_URL: &str = "TOLLGATE_BASE_URL";

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Daily limit per metered resource
    #[serde(default = "default_quotas")]
    pub quotas: BTreeMap<String, u64>,

    #[serde(default)]
    pub degradation: DegradationSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upstream data service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the records API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-request deadline in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Quota resource charged once per upstream request
    #[serde(default = "default_quota_resource")]
    pub quota_resource: String,

    /// Records requested per list call at Normal level
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Records requested per list call at Reduced level
    #[serde(default = "default_reduced_page_size")]
    pub reduced_page_size: u32,

    /// Records requested per list call at Minimal level
    #[serde(default = "default_minimal_page_size")]
    pub minimal_page_size: u32,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            quotas: default_quotas(),
            degradation: DegradationSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
            quota_resource: default_quota_resource(),
            page_size: default_page_size(),
            reduced_page_size: default_reduced_page_size(),
            minimal_page_size: default_minimal_page_size(),
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds to wait after the last failure before probing
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl From<&BreakerConfig> for CircuitBreakerConfig {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            reset_timeout: Duration::from_secs(config.reset_timeout_secs),
            success_threshold: config.success_threshold,
        }
    }
}

/// Retry and backoff tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
        }
    }
}

/// Degradation cache and recovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationSettings {
    /// Default lifetime of cached results in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Successes needed to step down one level; unset disables recovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_threshold: Option<u32>,
}

impl Default for DegradationSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            recovery_threshold: None,
        }
    }
}

impl From<&DegradationSettings> for DegradationConfig {
    fn from(settings: &DegradationSettings) -> Self {
        Self {
            default_ttl: Duration::from_secs(settings.cache_ttl_secs),
            recovery_threshold: settings.recovery_threshold,
        }
    }
}

/// Diagnostic output settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stderr)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_base_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_quota_resource() -> String {
    "api_calls".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_reduced_page_size() -> u32 {
    25
}

fn default_minimal_page_size() -> u32 {
    5
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> u64 {
    30
}

fn default_success_threshold() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    10_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_cache_ttl() -> u64 {
    5 * 60
}

fn default_quotas() -> BTreeMap<String, u64> {
    BTreeMap::from([(default_quota_resource(), 1000)])
}

impl TollgateConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `TOLLGATE_API_KEY` / `TOLLGATE_BASE_URL` when set
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.is_empty()) {
            self.upstream.api_key = Some(key);
        }
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.upstream.base_url = url;
        }
    }

    /// Check every section, including the core policy invariants
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.upstream.base_url)?;

        if self.upstream.request_timeout_secs == 0 {
            return Err(TollgateError::Config(
                "upstream.request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.upstream.page_size == 0
            || self.upstream.reduced_page_size == 0
            || self.upstream.minimal_page_size == 0
        {
            return Err(TollgateError::Config(
                "page sizes must be greater than zero".to_string(),
            ));
        }
        if !self.quotas.contains_key(&self.upstream.quota_resource) {
            return Err(TollgateError::Config(format!(
                "no quota configured for upstream resource '{}'",
                self.upstream.quota_resource
            )));
        }
        if let Some((name, _)) = self.quotas.iter().find(|(_, limit)| **limit == 0) {
            return Err(TollgateError::Config(format!(
                "quota limit for '{name}' must be greater than zero"
            )));
        }

        CircuitBreakerConfig::from(&self.breaker)
            .validate()
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        RetryPolicy::from(&self.retry)
            .validate()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        Ok(())
    }
}
