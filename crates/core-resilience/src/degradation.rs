//! Graceful degradation: severity-driven variant selection with a TTL cache
//!
//! The controller holds one severity level shared by every call site. Each
//! call supplies an [`OperationSet`] of variants of decreasing cost, and the
//! current level decides which one runs:
//!
//! ```text
//! Normal    → full
//! Reduced   → reduced, else full
//! Minimal   → minimal, else cached value (or None)
//! Emergency → cached value, else the caller's emergency value
//! ```
//!
//! A variant failing with a fallback-eligible error (transient, throttled,
//! unavailable, timeout, quota exhausted) escalates the level by one step and
//! the call is retried at the new level. Any other error, such as a rejected
//! request or a configuration problem, returns to the caller without
//! escalating. Emergency does not invoke variants, so a call makes at most
//! four attempts.
//!
//! The level only drops through [`DegradationController::set_degradation_level`],
//! [`DegradationController::reset`], or, when `recovery_threshold` is set:
//!
//! - below Emergency, after that many consecutive upstream successes
//! - at Emergency, every `recovery_threshold`-th call first tries the
//!   cheapest variant; a successful trial steps down to Minimal

use super::error::ResilienceError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Ordered severity of the degradation ladder
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    #[default]
    Normal = 0,
    Reduced = 1,
    Minimal = 2,
    Emergency = 3,
}

impl DegradationLevel {
    /// Numeric severity, 0 through 3
    pub fn severity(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            DegradationLevel::Normal => "NORMAL",
            DegradationLevel::Reduced => "REDUCED",
            DegradationLevel::Minimal => "MINIMAL",
            DegradationLevel::Emergency => "EMERGENCY",
        }
    }

    /// What is curtailed at this level
    pub fn description(self) -> &'static str {
        match self {
            DegradationLevel::Normal => "All features operating normally",
            DegradationLevel::Reduced => {
                "Reduced batch sizes and simplified filters; non-essential features disabled"
            }
            DegradationLevel::Minimal => {
                "Serving cached data where possible; only minimal upstream requests"
            }
            DegradationLevel::Emergency => {
                "Upstream calls suspended; serving cached or default data only"
            }
        }
    }

    /// One step more severe, or `None` at Emergency
    pub fn escalated(self) -> Option<Self> {
        match self {
            DegradationLevel::Normal => Some(DegradationLevel::Reduced),
            DegradationLevel::Reduced => Some(DegradationLevel::Minimal),
            DegradationLevel::Minimal => Some(DegradationLevel::Emergency),
            DegradationLevel::Emergency => None,
        }
    }

    /// One step less severe, or `None` at Normal
    pub fn relaxed(self) -> Option<Self> {
        match self {
            DegradationLevel::Normal => None,
            DegradationLevel::Reduced => Some(DegradationLevel::Normal),
            DegradationLevel::Minimal => Some(DegradationLevel::Reduced),
            DegradationLevel::Emergency => Some(DegradationLevel::Minimal),
        }
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A zero-argument async variant of an operation
pub type Variant<'a, T> =
    Box<dyn Fn() -> BoxFuture<'a, Result<T, ResilienceError>> + Send + Sync + 'a>;

fn boxed_variant<'a, T, F, Fut>(f: F) -> Variant<'a, T>
where
    F: Fn() -> Fut + Send + Sync + 'a,
    Fut: Future<Output = Result<T, ResilienceError>> + Send + 'a,
{
    Box::new(move || f().boxed())
}

/// Variants of one logical operation, from most to least expensive
pub struct OperationSet<'a, T> {
    full: Variant<'a, T>,
    reduced: Option<Variant<'a, T>>,
    minimal: Option<Variant<'a, T>>,
    cache_key: String,
    cache_before_minimal: bool,
}

impl<'a, T> OperationSet<'a, T> {
    pub fn new<F, Fut>(cache_key: impl Into<String>, full: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'a,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'a,
    {
        Self {
            full: boxed_variant(full),
            reduced: None,
            minimal: None,
            cache_key: cache_key.into(),
            cache_before_minimal: false,
        }
    }

    pub fn with_reduced<F, Fut>(mut self, reduced: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'a,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'a,
    {
        self.reduced = Some(boxed_variant(reduced));
        self
    }

    pub fn with_minimal<F, Fut>(mut self, minimal: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'a,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'a,
    {
        self.minimal = Some(boxed_variant(minimal));
        self
    }

    /// Like [`OperationSet::with_minimal`], but at Minimal an unexpired cache
    /// entry is served first and `minimal` only runs on a miss
    pub fn with_minimal_after_cache<F, Fut>(mut self, minimal: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'a,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'a,
    {
        self.minimal = Some(boxed_variant(minimal));
        self.cache_before_minimal = true;
        self
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Least expensive variant, used to test the upstream from Emergency
    fn cheapest(&self) -> &Variant<'a, T> {
        self.minimal
            .as_ref()
            .or(self.reduced.as_ref())
            .unwrap_or(&self.full)
    }
}

/// Values used when no variant may run
#[derive(Debug, Clone)]
pub struct FallbackOptions<T> {
    /// Returned at Emergency when the cache has nothing for the key
    pub emergency: Option<T>,
}

impl<T> Default for FallbackOptions<T> {
    fn default() -> Self {
        Self { emergency: None }
    }
}

impl<T> FallbackOptions<T> {
    pub fn emergency(value: T) -> Self {
        Self {
            emergency: Some(value),
        }
    }
}

/// Configuration for the degradation controller
#[derive(Debug, Clone, PartialEq)]
pub struct DegradationConfig {
    /// TTL applied when a cache write does not specify one
    pub default_ttl: Duration,
    /// Consecutive upstream successes at an elevated level before stepping
    /// down one level; at Emergency, calls between recovery trials.
    /// `None` disables automatic recovery.
    pub recovery_threshold: Option<u32>,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            recovery_threshold: None,
        }
    }
}

struct CacheEntry {
    data: Arc<dyn Any + Send + Sync>,
    expires_at: Instant,
}

#[derive(Debug)]
struct LevelState {
    level: DegradationLevel,
    /// Variant successes since the last level change or failure
    consecutive_successes: u32,
    /// Emergency calls since the last recovery trial
    calls_since_trial: u32,
}

/// Snapshot for health endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradationStatus {
    pub level: DegradationLevel,
    pub level_name: &'static str,
    pub severity: u8,
    pub cache_size: usize,
    pub description: &'static str,
}

/// Shared degradation state and result cache
///
/// Construct one per process and hand it to every call site through an `Arc`.
pub struct DegradationController {
    config: DegradationConfig,
    state: Mutex<LevelState>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl std::fmt::Debug for DegradationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationController")
            .field("config", &self.config)
            .field("level", &self.level())
            .field("cache_size", &self.cache_size())
            .finish()
    }
}

impl Default for DegradationController {
    fn default() -> Self {
        Self::new(DegradationConfig::default())
    }
}

impl DegradationController {
    pub fn new(config: DegradationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LevelState {
                level: DegradationLevel::Normal,
                consecutive_successes: 0,
                calls_since_trial: 0,
            }),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn level(&self) -> DegradationLevel {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .level
    }

    /// Move to `level`. A no-op, without logging, if already there.
    pub fn set_degradation_level(&self, level: DegradationLevel, reason: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.level == level {
            return;
        }

        let previous = state.level;
        state.level = level;
        state.consecutive_successes = 0;
        state.calls_since_trial = 0;
        drop(state);

        if level > previous {
            tracing::warn!(from = %previous, to = %level, reason, "Degradation level raised");
        } else {
            tracing::info!(from = %previous, to = %level, reason, "Degradation level lowered");
        }
    }

    /// Raise the level by one step. Returns the resulting level.
    pub fn escalate(&self, reason: &str) -> DegradationLevel {
        let current = self.level();
        self.escalate_from(current, reason)
    }

    /// Force the level back to Normal
    pub fn reset(&self) {
        self.set_degradation_level(DegradationLevel::Normal, "manual reset");
    }

    /// Escalate one step past `observed`, never lowering a level another
    /// caller already raised further.
    fn escalate_from(&self, observed: DegradationLevel, reason: &str) -> DegradationLevel {
        let Some(target) = observed.escalated() else {
            return DegradationLevel::Emergency;
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.consecutive_successes = 0;
        if state.level >= target {
            return state.level;
        }
        let previous = state.level;
        state.level = target;
        state.calls_since_trial = 0;
        drop(state);

        tracing::warn!(from = %previous, to = %target, reason, "Degradation level raised");
        target
    }

    fn record_variant_success(&self, level: DegradationLevel) {
        let Some(threshold) = self.config.recovery_threshold else {
            return;
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.level != level {
            return;
        }
        let Some(relaxed) = level.relaxed() else {
            return;
        };

        state.consecutive_successes += 1;
        if state.consecutive_successes >= threshold {
            state.level = relaxed;
            state.consecutive_successes = 0;
            drop(state);
            tracing::info!(
                from = %level,
                to = %relaxed,
                successes = threshold,
                "Degradation level lowered after sustained success"
            );
        }
    }

    /// Count an Emergency call; true when this one should try the upstream
    fn emergency_trial_due(&self) -> bool {
        let Some(threshold) = self.config.recovery_threshold else {
            return false;
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.level != DegradationLevel::Emergency {
            return false;
        }
        state.calls_since_trial += 1;
        if state.calls_since_trial < threshold {
            return false;
        }
        state.calls_since_trial = 0;
        true
    }

    fn recover_from_emergency(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.level != DegradationLevel::Emergency {
            return;
        }
        state.level = DegradationLevel::Minimal;
        state.consecutive_successes = 0;
        state.calls_since_trial = 0;
        drop(state);

        tracing::info!(
            from = %DegradationLevel::Emergency,
            to = %DegradationLevel::Minimal,
            "Degradation level lowered after successful recovery trial"
        );
    }

    /// Cache `data` under `key` for `ttl`, or the configured default TTL
    pub fn set_cached_result<T>(&self, key: impl Into<String>, data: T, ttl: Option<Duration>)
    where
        T: Send + Sync + 'static,
    {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let entry = CacheEntry {
            data: Arc::new(data),
            expires_at: Instant::now() + ttl,
        };
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), entry);
    }

    /// Cached value for `key` if present, unexpired, and of type `T`.
    /// An expired entry is evicted by this read.
    pub fn get_cached_result<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + 'static,
    {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.get(key)?;

        if Instant::now() >= entry.expires_at {
            cache.remove(key);
            return None;
        }

        entry.data.downcast_ref::<T>().cloned()
    }

    pub fn cache_size(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run the variant selected by the current level, escalating on failure
    ///
    /// Returns `Ok(None)` when Minimal has neither a `minimal` variant nor a
    /// cache entry, or when Emergency has neither a cache entry nor an
    /// emergency value. If a variant already failed during this call, that
    /// last error is returned instead of `None`. Errors that are not
    /// fallback-eligible are returned immediately without escalating.
    ///
    /// Cache hits never count toward recovery; only variant successes do.
    pub async fn execute_with_degradation<T>(
        &self,
        operations: &OperationSet<'_, T>,
        fallback: FallbackOptions<T>,
    ) -> Result<Option<T>, ResilienceError>
    where
        T: Clone + 'static,
    {
        let mut level = self.level();
        let mut last_error = None;

        loop {
            let variant = match level {
                DegradationLevel::Normal => &operations.full,
                DegradationLevel::Reduced => {
                    operations.reduced.as_ref().unwrap_or(&operations.full)
                }
                DegradationLevel::Minimal => {
                    let cache_first =
                        operations.cache_before_minimal || operations.minimal.is_none();
                    if cache_first {
                        if let Some(cached) = self.get_cached_result(&operations.cache_key) {
                            return Ok(Some(cached));
                        }
                    }
                    match &operations.minimal {
                        Some(minimal) => minimal,
                        None => return absent_or_error(None, last_error),
                    }
                }
                DegradationLevel::Emergency => {
                    // Only calls that started at Emergency get a recovery trial
                    if last_error.is_none() && self.emergency_trial_due() {
                        let trial = operations.cheapest();
                        match trial().await {
                            Ok(value) => {
                                self.recover_from_emergency();
                                return Ok(Some(value));
                            }
                            Err(err) if !err.is_fallback_eligible() => return Err(err),
                            Err(err) => {
                                tracing::debug!(
                                    key = %operations.cache_key,
                                    error = %err,
                                    "Recovery trial failed, staying at Emergency"
                                );
                                last_error = Some(err);
                            }
                        }
                    }

                    let served = self
                        .get_cached_result(&operations.cache_key)
                        .or(fallback.emergency);
                    return absent_or_error(served, last_error);
                }
            };

            match variant().await {
                Ok(value) => {
                    self.record_variant_success(level);
                    return Ok(Some(value));
                }
                Err(err) if !err.is_fallback_eligible() => return Err(err),
                Err(err) => {
                    let reason = format!("{} failed at {level}: {err}", operations.cache_key);
                    level = self.escalate_from(level, &reason);
                    last_error = Some(err);
                }
            }
        }
    }

    pub fn status(&self) -> DegradationStatus {
        let level = self.level();
        DegradationStatus {
            level,
            level_name: level.name(),
            severity: level.severity(),
            cache_size: self.cache_size(),
            description: level.description(),
        }
    }
}

fn absent_or_error<T>(
    served: Option<T>,
    last_error: Option<ResilienceError>,
) -> Result<Option<T>, ResilienceError> {
    match (served, last_error) {
        (Some(value), _) => Ok(Some(value)),
        (None, Some(err)) => Err(err),
        (None, None) => Ok(None),
    }
}
