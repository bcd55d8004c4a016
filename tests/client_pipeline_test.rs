//! End-to-end tests of the resilient client against an in-memory upstream

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tollgate::config::TollgateConfig;
use tollgate::resilience::{
    CircuitState, DegradationController, DegradationLevel, ResilienceError,
};
use tollgate::{EngagementEvent, ListQuery, Record, ResilientClient, Upstream};

#[derive(Clone)]
enum Reply {
    Ok,
    Fail(ResilienceError),
    Hang,
}

/// Replies are taken from the queue first, then `otherwise` forever
struct Script {
    queue: Mutex<VecDeque<Reply>>,
    otherwise: Mutex<Reply>,
    calls: AtomicU32,
}

impl Script {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            otherwise: Mutex::new(Reply::Ok),
            calls: AtomicU32::new(0),
        }
    }

    fn push(&self, reply: Reply) {
        self.queue.lock().unwrap().push_back(reply);
    }

    fn always(&self, reply: Reply) {
        *self.otherwise.lock().unwrap() = reply;
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn next(&self) -> Result<(), ResilienceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.lock().unwrap().clone());

        match reply {
            Reply::Ok => Ok(()),
            Reply::Fail(err) => Err(err),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

struct FakeUpstream {
    list: Script,
    get: Script,
    engage: Script,
    queries: Mutex<Vec<ListQuery>>,
    missing: Mutex<Vec<String>>,
}

impl FakeUpstream {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            list: Script::new(),
            get: Script::new(),
            engage: Script::new(),
            queries: Mutex::new(Vec::new()),
            missing: Mutex::new(Vec::new()),
        })
    }

    fn last_query(&self) -> ListQuery {
        self.queries.lock().unwrap().last().cloned().unwrap()
    }
}

fn record(id: &str) -> Record {
    Record {
        id: id.to_string(),
        fields: serde_json::Map::new(),
        created_time: None,
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    fn name(&self) -> &str {
        "fake-records"
    }

    async fn list_records(
        &self,
        _table: &str,
        query: &ListQuery,
    ) -> Result<Vec<Record>, ResilienceError> {
        self.queries.lock().unwrap().push(query.clone());
        self.list.next().await?;
        let count = query.limit.unwrap_or(3).min(3);
        Ok((0..count).map(|i| record(&format!("rec{i}"))).collect())
    }

    async fn get_record(&self, _table: &str, id: &str) -> Result<Option<Record>, ResilienceError> {
        self.get.next().await?;
        if self.missing.lock().unwrap().iter().any(|m| m == id) {
            return Ok(None);
        }
        Ok(Some(record(id)))
    }

    async fn push_engagement(&self, _event: &EngagementEvent) -> Result<(), ResilienceError> {
        self.engage.next().await
    }
}

fn test_config() -> TollgateConfig {
    let mut config = TollgateConfig::default();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 100;
    config
}

fn client_with(config: &TollgateConfig, upstream: Arc<FakeUpstream>) -> ResilientClient {
    ResilientClient::new(upstream, config, Arc::new(DegradationController::default())).unwrap()
}

fn throttled() -> Reply {
    Reply::Fail(ResilienceError::Throttled("429 Too Many Requests".to_string()))
}

#[tokio::test(start_paused = true)]
async fn test_list_happy_path_caches_and_counts() {
    let upstream = FakeUpstream::new();
    let client = client_with(&test_config(), upstream.clone());

    let query = ListQuery::new().filter("open").sort_by("created");
    let records = client.list_records("Tasks", &query).await.unwrap();

    assert_eq!(records.len(), 3);
    assert_eq!(upstream.list.calls(), 1);
    assert_eq!(upstream.last_query().limit, Some(100));
    assert_eq!(upstream.last_query().sort, vec!["created".to_string()]);

    assert_eq!(client.degradation().cache_size(), 1);
    assert_eq!(client.quotas().usage_stats()["api_calls"].used, 1);

    let stats = client.breaker().stats().await;
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_with_one_quota_charge() {
    let upstream = FakeUpstream::new();
    upstream
        .list
        .push(Reply::Fail(ResilienceError::Transient("reset".to_string())));
    upstream.list.push(throttled());
    let client = client_with(&test_config(), upstream.clone());

    let records = client.list_records("Tasks", &ListQuery::new()).await.unwrap();

    assert_eq!(records.len(), 3);
    assert_eq!(upstream.list.calls(), 3);
    assert_eq!(client.quotas().usage_stats()["api_calls"].used, 1);
    assert_eq!(client.degradation().level(), DegradationLevel::Normal);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_throttling_degrades_then_falls_back_to_empty() {
    let upstream = FakeUpstream::new();
    upstream.list.always(throttled());
    let client = client_with(&test_config(), upstream.clone());

    let query = ListQuery::new().sort_by("created").field("title");
    let records = client.list_records("Tasks", &query).await.unwrap();

    assert!(records.is_empty());
    // Full, reduced and minimal shapes, each with 1 + 3 retries
    assert_eq!(upstream.list.calls(), 12);
    assert_eq!(client.degradation().level(), DegradationLevel::Emergency);

    let queries = upstream.queries.lock().unwrap().clone();
    assert_eq!(queries[0].limit, Some(100));
    assert_eq!(queries[4].limit, Some(25));
    assert!(queries[4].sort.is_empty());
    assert_eq!(queries[8].limit, Some(5));
    assert!(queries[8].fields.is_empty());

    let stats = client.breaker().stats().await;
    assert_eq!(stats.total_failures, 1);
    assert_eq!(stats.total_fallbacks, 1);
    assert_eq!(stats.state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_levels_serve_cached_results() {
    let upstream = FakeUpstream::new();
    let client = client_with(&test_config(), upstream.clone());
    let query = ListQuery::new().filter("open");

    let fresh = client.list_records("Tasks", &query).await.unwrap();
    assert_eq!(upstream.list.calls(), 1);

    client
        .degradation()
        .set_degradation_level(DegradationLevel::Minimal, "test");
    let cached = client.list_records("Tasks", &query).await.unwrap();
    assert_eq!(cached, fresh);

    client
        .degradation()
        .set_degradation_level(DegradationLevel::Emergency, "test");
    let cached = client.list_records("Tasks", &query).await.unwrap();
    assert_eq!(cached, fresh);

    assert_eq!(upstream.list.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_expiry_empties_emergency_results() {
    let upstream = FakeUpstream::new();
    let client = client_with(&test_config(), upstream.clone());
    let query = ListQuery::new();

    client.list_records("Tasks", &query).await.unwrap();
    client
        .degradation()
        .set_degradation_level(DegradationLevel::Emergency, "test");

    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    let records = client.list_records("Tasks", &query).await.unwrap();

    assert!(records.is_empty());
    assert_eq!(client.degradation().cache_size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_quota_exhaustion_degrades_to_cache() {
    let mut config = test_config();
    config.quotas.insert("api_calls".to_string(), 10);
    let upstream = FakeUpstream::new();
    let client = client_with(&config, upstream.clone());
    let query = ListQuery::new();

    for _ in 0..9 {
        client.list_records("Tasks", &query).await.unwrap();
    }
    assert_eq!(upstream.list.calls(), 9);

    let records = client.list_records("Tasks", &query).await.unwrap();

    assert_eq!(records.len(), 3);
    assert_eq!(upstream.list.calls(), 9);
    assert_eq!(client.degradation().level(), DegradationLevel::Minimal);
    assert_eq!(client.quotas().usage_stats()["api_calls"].used, 9);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_fall_back_to_none() {
    let mut config = test_config();
    config.retry.max_retries = 0;
    let upstream = FakeUpstream::new();
    upstream.get.always(Reply::Hang);
    let client = client_with(&config, upstream.clone());

    let start = tokio::time::Instant::now();
    let record = client.get_record("Tasks", "rec1").await.unwrap();

    assert_eq!(record, None);
    // Normal, Reduced (full again) and Minimal each hit the 30s deadline
    assert_eq!(upstream.get.calls(), 3);
    assert!(start.elapsed() >= Duration::from_secs(90));

    let stats = client.breaker().stats().await;
    assert_eq!(stats.total_fallbacks, 1);
    assert_eq!(client.degradation().level(), DegradationLevel::Emergency);

    client.degradation().reset();
    upstream.get.always(Reply::Ok);
    let record = client.get_record("Tasks", "rec1").await.unwrap();
    assert_eq!(record.map(|r| r.id), Some("rec1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_missing_record_is_none_and_cached() {
    let upstream = FakeUpstream::new();
    upstream.missing.lock().unwrap().push("gone".to_string());
    let client = client_with(&test_config(), upstream.clone());

    assert_eq!(client.get_record("Tasks", "gone").await.unwrap(), None);
    assert_eq!(client.degradation().cache_size(), 1);
    assert_eq!(client.breaker().stats().await.total_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_errors_are_not_retried_or_masked() {
    let upstream = FakeUpstream::new();
    upstream
        .get
        .always(Reply::Fail(ResilienceError::Permanent("400 Bad Request".to_string())));
    let client = client_with(&test_config(), upstream.clone());

    let err = client.get_record("Tasks", "bad id").await.unwrap_err();

    assert_eq!(err, ResilienceError::Permanent("400 Bad Request".to_string()));
    // A single attempt: no retries and no escalation
    assert_eq!(upstream.get.calls(), 1);
    assert_eq!(client.degradation().level(), DegradationLevel::Normal);
    assert_eq!(client.breaker().stats().await.total_fallbacks, 0);

    // Reads on a healthy endpoint still reach the upstream
    let records = client.list_records("Tasks", &ListQuery::new()).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(upstream.list.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_engagement_failures_open_own_breaker_and_are_swallowed() {
    let mut config = test_config();
    config.breaker.failure_threshold = 2;
    config.retry.max_retries = 0;
    let upstream = FakeUpstream::new();
    upstream
        .engage
        .always(Reply::Fail(ResilienceError::Unavailable("cold start".to_string())));
    let client = client_with(&config, upstream.clone());
    let event = EngagementEvent::new("view").for_record("rec1");

    client.record_engagement(&event).await;
    client.record_engagement(&event).await;
    assert_eq!(client.engagement_breaker().get_state().await, CircuitState::Open);
    assert_eq!(upstream.engage.calls(), 2);

    // Open circuit: no upstream traffic, nothing surfaces to the caller
    client.record_engagement(&event).await;
    assert_eq!(upstream.engage.calls(), 2);

    // Reads are untouched
    assert_eq!(client.breaker().get_state().await, CircuitState::Closed);
    let records = client.list_records("Tasks", &ListQuery::new()).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(upstream.list.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_engagement_endpoint_does_not_blank_reads() {
    let upstream = FakeUpstream::new();
    upstream
        .engage
        .always(Reply::Fail(ResilienceError::Permanent("404 Not Found".to_string())));
    let client = client_with(&test_config(), upstream.clone());

    for _ in 0..5 {
        client.record_engagement(&EngagementEvent::new("view")).await;
    }
    assert_eq!(client.engagement_breaker().get_state().await, CircuitState::Open);

    let records = client.list_records("Tasks", &ListQuery::new()).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(upstream.list.calls(), 1);
    assert_eq!(client.breaker().stats().await.total_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_engagement_shed_when_degraded() {
    let upstream = FakeUpstream::new();
    let client = client_with(&test_config(), upstream.clone());
    client
        .degradation()
        .set_degradation_level(DegradationLevel::Reduced, "test");

    client.record_engagement(&EngagementEvent::new("view")).await;

    assert_eq!(upstream.engage.calls(), 0);
    assert_eq!(client.engagement_breaker().stats().await.total_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shared_degradation_controller() {
    let degradation = Arc::new(DegradationController::default());
    let config = test_config();

    let failing = FakeUpstream::new();
    failing.list.always(throttled());
    let healthy = FakeUpstream::new();

    let first = ResilientClient::new(failing.clone(), &config, degradation.clone()).unwrap();
    let second = ResilientClient::new(healthy.clone(), &config, degradation.clone()).unwrap();

    first.list_records("Tasks", &ListQuery::new()).await.unwrap();
    assert_eq!(degradation.level(), DegradationLevel::Emergency);

    // The healthy client sees the shared level and makes no upstream call
    let records = second.list_records("Tasks", &ListQuery::new()).await.unwrap();
    assert!(records.is_empty());
    assert_eq!(healthy.list.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_trial_leaves_emergency_on_real_upstream_success() {
    let mut config = test_config();
    config.degradation.recovery_threshold = Some(2);
    let degradation = Arc::new(DegradationController::new((&config.degradation).into()));
    let upstream = FakeUpstream::new();
    let client = ResilientClient::new(upstream.clone(), &config, degradation.clone()).unwrap();
    let query = ListQuery::new().filter("open");

    client.list_records("Tasks", &query).await.unwrap();
    degradation.set_degradation_level(DegradationLevel::Emergency, "test");

    // First Emergency call is served from cache
    client.list_records("Tasks", &query).await.unwrap();
    assert_eq!(upstream.list.calls(), 1);
    assert_eq!(degradation.level(), DegradationLevel::Emergency);

    // Second tries the minimal shape
    client.list_records("Tasks", &query).await.unwrap();
    assert_eq!(upstream.list.calls(), 2);
    assert_eq!(upstream.last_query().limit, Some(5));
    assert_eq!(degradation.level(), DegradationLevel::Minimal);

    // Minimal cache hits are not upstream successes
    for _ in 0..4 {
        client.list_records("Tasks", &query).await.unwrap();
    }
    assert_eq!(upstream.list.calls(), 2);
    assert_eq!(degradation.level(), DegradationLevel::Minimal);
}

#[tokio::test(start_paused = true)]
async fn test_health_report_serializes() {
    let upstream = FakeUpstream::new();
    let client = client_with(&test_config(), upstream.clone());
    client.list_records("Tasks", &ListQuery::new()).await.unwrap();

    let json = serde_json::to_value(client.health().await).unwrap();

    assert_eq!(json["upstream"], "fake-records");
    assert_eq!(json["breaker"]["state"], "CLOSED");
    assert_eq!(json["breaker"]["total_requests"], 1);
    assert_eq!(json["engagement_breaker"]["total_requests"], 0);
    assert_eq!(json["quotas"]["api_calls"]["used"], 1);
    assert_eq!(json["quotas"]["api_calls"]["remaining"], 999);
    assert_eq!(json["degradation"]["level"], "normal");
    assert_eq!(json["degradation"]["cache_size"], 1);
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = test_config();
    config.upstream.quota_resource = "uploads".to_string();

    let result = ResilientClient::new(
        FakeUpstream::new(),
        &config,
        Arc::new(DegradationController::default()),
    );
    assert!(result.is_err());
}
