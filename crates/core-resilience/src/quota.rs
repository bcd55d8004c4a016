//! Daily quota tracking for metered upstream resources
//!
//! Each named resource has a fixed daily ceiling. Usage resets lazily at the
//! next local midnight: nothing runs in the background, the reset happens on
//! the first check or stats read at or after the boundary.
//!
//! A check fails once usage reaches the critical threshold (95% of the
//! limit), leaving headroom for calls the application cannot defer. From 80%
//! upward checks still pass but are reported as [`QuotaLevel::Warning`].
//!
//! # Example
//!
//! ```
//! use tollgate_core_resilience::quota::{QuotaLevel, QuotaLimiter};
//!
//! let limiter = QuotaLimiter::new([("api_calls", 1000)]).unwrap();
//!
//! let check = limiter.check_quota("api_calls").unwrap();
//! assert_eq!(check.used, 1);
//! assert_eq!(check.level, QuotaLevel::Normal);
//!
//! assert!(limiter.check_quota("unknown").is_err());
//! ```

use super::error::ResilienceError;
use chrono::{DateTime, Local, TimeDelta};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

/// Usage percentage at which checks start reporting a warning
pub const WARNING_THRESHOLD_PCT: u64 = 80;

/// Usage percentage at which checks are refused
pub const CRITICAL_THRESHOLD_PCT: u64 = 95;

/// Usage record for one resource
#[derive(Debug, Clone)]
struct Quota {
    used: u64,
    limit: u64,
    reset_at: DateTime<Local>,
}

impl Quota {
    /// Zero the counter if the reset boundary has passed
    fn roll_over(&mut self, resource: &str, now: DateTime<Local>) {
        if now >= self.reset_at {
            tracing::info!(
                resource,
                previous_used = self.used,
                "Daily quota window rolled over"
            );
            self.used = 0;
            self.reset_at = next_local_midnight(now);
        }
    }

    /// Number of checks allowed per window
    fn critical_ceiling(&self) -> u64 {
        self.limit.saturating_mul(CRITICAL_THRESHOLD_PCT) / 100
    }

    fn at_warning(&self) -> bool {
        self.used.saturating_mul(100) >= self.limit.saturating_mul(WARNING_THRESHOLD_PCT)
    }
}

/// Pressure reported by a successful check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaLevel {
    /// Below the warning threshold
    Normal,
    /// At or above the warning threshold, below critical
    Warning,
}

/// Result of a successful quota check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaCheck {
    pub resource: String,
    /// Usage after this check was counted
    pub used: u64,
    pub limit: u64,
    pub level: QuotaLevel,
}

/// Snapshot of one resource for health endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub used: u64,
    pub limit: u64,
    /// Usage percentage rounded to one decimal place
    pub percentage: f64,
    pub remaining: u64,
    /// Milliseconds until the next reset
    pub reset_in_ms: u64,
}

/// Per-resource daily quota limiter
#[derive(Debug)]
pub struct QuotaLimiter {
    quotas: Mutex<HashMap<String, Quota>>,
}

impl QuotaLimiter {
    /// Create a limiter whose first window ends at the next local midnight
    pub fn new<I, S>(limits: I) -> Result<Self, ResilienceError>
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self::with_start(limits, Local::now())
    }

    /// Create a limiter as if constructed at `now`
    pub fn with_start<I, S>(limits: I, now: DateTime<Local>) -> Result<Self, ResilienceError>
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let reset_at = next_local_midnight(now);
        let mut quotas = HashMap::new();

        for (name, limit) in limits {
            let name = name.into();
            if limit == 0 {
                return Err(ResilienceError::Configuration(format!(
                    "quota limit for '{name}' must be greater than zero"
                )));
            }
            quotas.insert(
                name,
                Quota {
                    used: 0,
                    limit,
                    reset_at,
                },
            );
        }

        Ok(Self {
            quotas: Mutex::new(quotas),
        })
    }

    /// Count one use of `resource`, or fail if it is at its critical threshold
    pub fn check_quota(&self, resource: &str) -> Result<QuotaCheck, ResilienceError> {
        self.check_quota_at(resource, Local::now())
    }

    /// [`check_quota`](Self::check_quota) evaluated at `now`
    pub fn check_quota_at(
        &self,
        resource: &str,
        now: DateTime<Local>,
    ) -> Result<QuotaCheck, ResilienceError> {
        let mut quotas = self.quotas.lock().unwrap_or_else(PoisonError::into_inner);
        let quota = quotas.get_mut(resource).ok_or_else(|| {
            ResilienceError::Configuration(format!("unknown quota resource '{resource}'"))
        })?;

        quota.roll_over(resource, now);

        if quota.used >= quota.critical_ceiling() {
            tracing::error!(
                resource,
                used = quota.used,
                limit = quota.limit,
                "Quota at critical threshold, refusing call"
            );
            return Err(ResilienceError::QuotaExhausted {
                resource: resource.to_string(),
                used: quota.used,
                limit: quota.limit,
            });
        }

        let level = if quota.at_warning() {
            tracing::warn!(
                resource,
                used = quota.used,
                limit = quota.limit,
                "Quota usage above warning threshold"
            );
            QuotaLevel::Warning
        } else {
            QuotaLevel::Normal
        };

        quota.used += 1;

        Ok(QuotaCheck {
            resource: resource.to_string(),
            used: quota.used,
            limit: quota.limit,
            level,
        })
    }

    /// Per-resource usage snapshot
    pub fn usage_stats(&self) -> BTreeMap<String, QuotaUsage> {
        self.usage_stats_at(Local::now())
    }

    /// [`usage_stats`](Self::usage_stats) evaluated at `now`
    pub fn usage_stats_at(&self, now: DateTime<Local>) -> BTreeMap<String, QuotaUsage> {
        let mut quotas = self.quotas.lock().unwrap_or_else(PoisonError::into_inner);

        quotas
            .iter_mut()
            .map(|(name, quota)| {
                quota.roll_over(name, now);
                let percentage =
                    (quota.used as f64 / quota.limit as f64 * 1000.0).round() / 10.0;
                let reset_in_ms = (quota.reset_at - now).num_milliseconds().max(0) as u64;

                (
                    name.clone(),
                    QuotaUsage {
                        used: quota.used,
                        limit: quota.limit,
                        percentage,
                        remaining: quota.limit.saturating_sub(quota.used),
                        reset_in_ms,
                    },
                )
            })
            .collect()
    }
}

/// The first local midnight strictly after `now`
fn next_local_midnight(now: DateTime<Local>) -> DateTime<Local> {
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        // Midnight skipped by a DST change: fall back to a fixed day
        .unwrap_or_else(|| now + TimeDelta::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_allows_up_to_critical_threshold() {
        let limiter = QuotaLimiter::with_start([("records", 100)], noon()).unwrap();

        for i in 1..=95 {
            let check = limiter.check_quota_at("records", noon()).unwrap();
            assert_eq!(check.used, i);
        }

        let err = limiter.check_quota_at("records", noon()).unwrap_err();
        assert_eq!(
            err,
            ResilienceError::QuotaExhausted {
                resource: "records".to_string(),
                used: 95,
                limit: 100,
            }
        );

        // Refused checks do not count
        assert_eq!(limiter.usage_stats_at(noon())["records"].used, 95);
    }

    #[test]
    fn test_small_limit_rounds_down() {
        let limiter = QuotaLimiter::with_start([("builds", 10)], noon()).unwrap();

        for _ in 0..9 {
            assert!(limiter.check_quota_at("builds", noon()).is_ok());
        }
        assert!(limiter
            .check_quota_at("builds", noon())
            .unwrap_err()
            .is_quota());
    }

    #[test]
    fn test_warning_level_from_eighty_percent() {
        let limiter = QuotaLimiter::with_start([("records", 100)], noon()).unwrap();

        for _ in 0..80 {
            let check = limiter.check_quota_at("records", noon()).unwrap();
            assert_eq!(check.level, QuotaLevel::Normal);
        }

        let check = limiter.check_quota_at("records", noon()).unwrap();
        assert_eq!(check.level, QuotaLevel::Warning);
        assert_eq!(check.used, 81);
    }

    #[test]
    fn test_midnight_rollover_resets_usage() {
        let limiter = QuotaLimiter::with_start([("records", 20)], noon()).unwrap();
        while limiter.check_quota_at("records", noon()).is_ok() {}

        let after_midnight = Local.with_ymd_and_hms(2024, 6, 16, 0, 0, 1).unwrap();
        let check = limiter.check_quota_at("records", after_midnight).unwrap();
        assert_eq!(check.used, 1);

        let stats = limiter.usage_stats_at(after_midnight);
        let expected_reset = Local.with_ymd_and_hms(2024, 6, 17, 0, 0, 0).unwrap();
        assert_eq!(
            stats["records"].reset_in_ms,
            (expected_reset - after_midnight).num_milliseconds() as u64
        );
    }

    #[test]
    fn test_usage_stats_after_lazy_reset() {
        let limiter = QuotaLimiter::with_start([("records", 50)], noon()).unwrap();
        for _ in 0..10 {
            limiter.check_quota_at("records", noon()).unwrap();
        }

        let stats = limiter.usage_stats_at(noon());
        assert_eq!(stats["records"].used, 10);
        assert_eq!(stats["records"].percentage, 20.0);
        assert_eq!(stats["records"].remaining, 40);

        let next_day = Local.with_ymd_and_hms(2024, 6, 16, 8, 0, 0).unwrap();
        let stats = limiter.usage_stats_at(next_day);
        assert_eq!(stats["records"].used, 0);
        assert_eq!(stats["records"].remaining, 50);
        assert_eq!(stats["records"].percentage, 0.0);
    }

    #[test]
    fn test_percentage_has_one_decimal() {
        let limiter = QuotaLimiter::with_start([("records", 3)], noon()).unwrap();
        limiter.check_quota_at("records", noon()).unwrap();
        assert_eq!(limiter.usage_stats_at(noon())["records"].percentage, 33.3);
    }

    #[test]
    fn test_resources_are_independent() {
        let limiter =
            QuotaLimiter::with_start([("records", 100), ("builds", 10)], noon()).unwrap();
        while limiter.check_quota_at("builds", noon()).is_ok() {}

        assert!(limiter.check_quota_at("records", noon()).is_ok());
        let stats = limiter.usage_stats_at(noon());
        assert_eq!(stats["records"].used, 1);
        assert_eq!(stats["builds"].used, 9);
    }

    #[test]
    fn test_unknown_resource_is_configuration_error() {
        let limiter = QuotaLimiter::with_start([("records", 100)], noon()).unwrap();
        let err = limiter.check_quota_at("uploads", noon()).unwrap_err();
        assert!(err.is_fatal());
        assert!(!err.is_quota());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let err = QuotaLimiter::new([("records", 0)]).unwrap_err();
        assert!(matches!(err, ResilienceError::Configuration(_)));
    }

    #[test]
    fn test_first_reset_is_next_midnight() {
        let limiter = QuotaLimiter::with_start([("records", 100)], noon()).unwrap();
        let stats = limiter.usage_stats_at(noon());
        assert_eq!(stats["records"].reset_in_ms, 12 * 60 * 60 * 1000);
    }
}
