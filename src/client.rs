/*!
 * Resilient client: every upstream call runs through the full pipeline
 *
 * ```text
 * CircuitBreaker -> DegradationController -> QuotaLimiter -> retry/backoff -> timeout -> Upstream
 * ```
 *
 * Reads degrade to cheaper request shapes and cached results as the shared
 * degradation level rises. When nothing can be served the breaker answers
 * with an empty result. Engagement pushes are best effort and never fail the
 * caller.
 */

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tollgate_core_resilience::{
    retry_with_backoff, BreakerStats, CircuitBreaker, CircuitBreakerConfig, DegradationConfig,
    DegradationController, DegradationLevel, DegradationStatus, FallbackOptions, OperationSet,
    QuotaLimiter, QuotaUsage, ResilienceError, RetryPolicy,
};

use crate::config::{TollgateConfig, UpstreamConfig};
use crate::error::Result;
use crate::upstream::{EngagementEvent, HttpUpstream, ListQuery, Record, Upstream};

/// Aggregated health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub upstream: String,
    pub breaker: BreakerStats,
    pub engagement_breaker: BreakerStats,
    pub quotas: BTreeMap<String, QuotaUsage>,
    pub degradation: DegradationStatus,
    pub checked_at: DateTime<Utc>,
}

/// Client for a quota-limited, unreliable records service
pub struct ResilientClient {
    upstream: Arc<dyn Upstream>,
    breaker: CircuitBreaker,
    /// Guards engagement pushes only, so they never trip reads
    engagement_breaker: CircuitBreaker,
    quotas: QuotaLimiter,
    degradation: Arc<DegradationController>,
    retry: RetryPolicy,
    settings: UpstreamConfig,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("upstream", &self.upstream.name())
            .field("breaker", &self.breaker)
            .field("engagement_breaker", &self.engagement_breaker)
            .field("quotas", &self.quotas)
            .field("degradation", &self.degradation)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ResilientClient {
    /// Build a client over `upstream`, sharing `degradation` with other call sites
    pub fn new(
        upstream: Arc<dyn Upstream>,
        config: &TollgateConfig,
        degradation: Arc<DegradationController>,
    ) -> Result<Self> {
        config.validate()?;

        let breaker_config = CircuitBreakerConfig::from(&config.breaker);
        let breaker = CircuitBreaker::new(upstream.name().to_string(), breaker_config.clone());
        let engagement_breaker =
            CircuitBreaker::new(format!("{}-engagement", upstream.name()), breaker_config);
        let quotas = QuotaLimiter::new(
            config
                .quotas
                .iter()
                .map(|(name, limit)| (name.clone(), *limit)),
        )?;

        Ok(Self {
            upstream,
            breaker,
            engagement_breaker,
            quotas,
            degradation,
            retry: RetryPolicy::from(&config.retry),
            settings: config.upstream.clone(),
        })
    }

    /// Build a client talking HTTP to `config.upstream.base_url`
    pub fn from_config(config: &TollgateConfig) -> Result<Self> {
        let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);
        let degradation = Arc::new(DegradationController::new(DegradationConfig::from(
            &config.degradation,
        )));
        Self::new(upstream, config, degradation)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn engagement_breaker(&self) -> &CircuitBreaker {
        &self.engagement_breaker
    }

    pub fn quotas(&self) -> &QuotaLimiter {
        &self.quotas
    }

    pub fn degradation(&self) -> &Arc<DegradationController> {
        &self.degradation
    }

    /// List records from `table`, degrading as needed
    ///
    /// Yields an empty list when the breaker is open or every variant failed
    /// with a fallback-eligible error.
    pub async fn list_records(
        &self,
        table: &str,
        query: &ListQuery,
    ) -> std::result::Result<Vec<Record>, ResilienceError> {
        let cache_key = query.cache_key(table);
        let full_query = query.full_shape(self.settings.page_size);
        let reduced_query = query.reduced_shape(self.settings.reduced_page_size);
        let minimal_query = query.minimal_shape(self.settings.minimal_page_size);

        let this = self;
        let key = cache_key.as_str();
        let (full_query, reduced_query, minimal_query) =
            (&full_query, &reduced_query, &minimal_query);

        let operations = OperationSet::new(key, move || async move {
            let records = this.fetch_list(table, full_query).await?;
            this.degradation.set_cached_result(key, records.clone(), None);
            Ok(records)
        })
        .with_reduced(move || async move {
            let records = this.fetch_list(table, reduced_query).await?;
            this.degradation.set_cached_result(key, records.clone(), None);
            Ok(records)
        })
        .with_minimal_after_cache(move || this.fetch_list(table, minimal_query));

        let (degradation, operations) = (&self.degradation, &operations);
        self.breaker
            .fire(
                move || async move {
                    let records = degradation
                        .execute_with_degradation(operations, FallbackOptions::default())
                        .await?;
                    Ok(records.unwrap_or_default())
                },
                Vec::new,
            )
            .await
    }

    /// Fetch a single record, or `None` when it is missing or cannot be served
    pub async fn get_record(
        &self,
        table: &str,
        id: &str,
    ) -> std::result::Result<Option<Record>, ResilienceError> {
        let cache_key = format!("record:{table}/{id}");

        let this = self;
        let key = cache_key.as_str();

        let operations = OperationSet::new(key, move || async move {
            let record = this.fetch_record(table, id).await?;
            this.degradation.set_cached_result(key, record.clone(), None);
            Ok(record)
        })
        .with_minimal_after_cache(move || this.fetch_record(table, id));

        let (degradation, operations) = (&self.degradation, &operations);
        self.breaker
            .fire(
                move || async move {
                    let record = degradation
                        .execute_with_degradation(operations, FallbackOptions::default())
                        .await?;
                    Ok(record.flatten())
                },
                || None,
            )
            .await
    }

    /// Push an engagement metric; failures are logged and dropped
    ///
    /// Skipped entirely once the degradation level reaches Reduced, where
    /// non-essential traffic is shed. Runs behind its own breaker.
    pub async fn record_engagement(&self, event: &EngagementEvent) {
        let level = self.degradation.level();
        if level >= DegradationLevel::Reduced {
            tracing::debug!(kind = %event.kind, level = %level, "Engagement push shed");
            return;
        }

        let result = self
            .engagement_breaker
            .call(|| self.guarded(|| self.upstream.push_engagement(event)))
            .await;

        if let Err(err) = result {
            tracing::warn!(
                kind = %event.kind,
                error = %err,
                "Engagement push failed, dropping event"
            );
        }
    }

    /// Snapshot of breaker, quota and degradation state
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            upstream: self.upstream.name().to_string(),
            breaker: self.breaker.stats().await,
            engagement_breaker: self.engagement_breaker.stats().await,
            quotas: self.quotas.usage_stats(),
            degradation: self.degradation.status(),
            checked_at: Utc::now(),
        }
    }

    async fn fetch_list(
        &self,
        table: &str,
        query: &ListQuery,
    ) -> std::result::Result<Vec<Record>, ResilienceError> {
        self.guarded(|| self.upstream.list_records(table, query)).await
    }

    async fn fetch_record(
        &self,
        table: &str,
        id: &str,
    ) -> std::result::Result<Option<Record>, ResilienceError> {
        self.guarded(|| self.upstream.get_record(table, id)).await
    }

    /// Charge the quota once, then run `request` with retries, each attempt
    /// bounded by the request timeout
    async fn guarded<T, F, Fut>(&self, mut request: F) -> std::result::Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ResilienceError>>,
    {
        self.quotas.check_quota(&self.settings.quota_resource)?;

        let deadline = self.settings.request_timeout();
        retry_with_backoff(
            || with_deadline(request(), deadline),
            &self.retry,
            is_retryable,
        )
        .await
    }
}

/// Quota, configuration and permanent errors are never retried
fn is_retryable(err: &ResilienceError) -> bool {
    err.is_transient()
}

async fn with_deadline<T, Fut>(
    request: Fut,
    deadline: Duration,
) -> std::result::Result<T, ResilienceError>
where
    Fut: Future<Output = std::result::Result<T, ResilienceError>>,
{
    match tokio::time::timeout(deadline, request).await {
        Ok(result) => result,
        Err(_) => Err(ResilienceError::Timeout(deadline)),
    }
}
