/*!
 * Upstream records service abstraction
 *
 * [`Upstream`] is the seam between the resilience pipeline and the network.
 * Implementations report every failure as a typed [`ResilienceError`] so
 * retry and fallback decisions never inspect message text.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tollgate_core_resilience::ResilienceError;
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::{Result, TollgateError};

/// Header carrying the remaining daily quota, when the upstream sends one
pub const QUOTA_REMAINING_HEADER: &str = "x-quota-remaining";

/// Header carrying the daily quota limit, when the upstream sends one
pub const QUOTA_LIMIT_HEADER: &str = "x-quota-limit";

/// A single row returned by the records service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,
}

/// Parameters of a list request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    /// Server-side filter expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Fields to sort by, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<String>,
    /// Fields to return; empty means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    /// Maximum number of records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>) -> Self {
        self.sort.push(field.into());
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The caller's limit, capped at `page_size`
    fn capped(mut self, page_size: u32) -> Self {
        self.limit = Some(self.limit.map_or(page_size, |limit| limit.min(page_size)));
        self
    }

    /// Full request: every clause, capped at the normal page size
    pub fn full_shape(&self, page_size: u32) -> Self {
        self.clone().capped(page_size)
    }

    /// Cheaper request: server-side sorting dropped, smaller page
    pub fn reduced_shape(&self, page_size: u32) -> Self {
        let mut query = self.clone().capped(page_size);
        query.sort.clear();
        query
    }

    /// Cheapest request: filter only, smallest page
    pub fn minimal_shape(&self, page_size: u32) -> Self {
        Self {
            filter: self.filter.clone(),
            ..Self::default()
        }
        .capped(page_size)
    }

    /// Stable cache key for this query against `table`
    pub fn cache_key(&self, table: &str) -> String {
        format!(
            "records:{table}?filter={}&sort={}&fields={}&limit={}",
            self.filter.as_deref().unwrap_or(""),
            self.sort.join(","),
            self.fields.join(","),
            self.limit.map(|l| l.to_string()).unwrap_or_default(),
        )
    }
}

/// An engagement metric pushed back to the records service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl EngagementEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            record_id: None,
            occurred_at: Utc::now(),
            properties: serde_json::Map::new(),
        }
    }

    pub fn for_record(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }
}

/// Records service operations used by the client
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Name used for the circuit breaker and log fields
    fn name(&self) -> &str;

    async fn list_records(
        &self,
        table: &str,
        query: &ListQuery,
    ) -> std::result::Result<Vec<Record>, ResilienceError>;

    /// `Ok(None)` when the record does not exist
    async fn get_record(
        &self,
        table: &str,
        id: &str,
    ) -> std::result::Result<Option<Record>, ResilienceError>;

    async fn push_engagement(
        &self,
        event: &EngagementEvent,
    ) -> std::result::Result<(), ResilienceError>;
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    records: Vec<Record>,
}

/// [`Upstream`] over HTTP with JSON bodies
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    quota_resource: String,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(TollgateError::Config(format!(
                "upstream base_url '{}' cannot carry a path",
                config.base_url
            )));
        }

        let timeout = config.request_timeout();
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            quota_resource: config.quota_resource.clone(),
            timeout,
        })
    }

    /// `base_url` with `segments` appended as path components
    fn endpoint(&self, segments: &[&str]) -> std::result::Result<Url, ResilienceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ResilienceError::Configuration(format!(
                    "upstream base_url '{}' cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(AUTHORIZATION, format!("Bearer {key}")),
            None => request,
        }
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<reqwest::Response, ResilienceError> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| classify_transport(&e, self.timeout))
    }

    async fn ensure_success(
        &self,
        response: reqwest::Response,
    ) -> std::result::Result<reqwest::Response, ResilienceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(
            status,
            &headers,
            &body,
            &self.quota_resource,
        ))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<reqwest::Response, ResilienceError> {
        let response = self.execute(request).await?;
        self.ensure_success(response).await
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    fn name(&self) -> &str {
        self.base_url.host_str().unwrap_or("upstream")
    }

    async fn list_records(
        &self,
        table: &str,
        query: &ListQuery,
    ) -> std::result::Result<Vec<Record>, ResilienceError> {
        let url = self.endpoint(&[table])?;

        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(filter) = &query.filter {
            params.push(("filter", filter.clone()));
        }
        if !query.sort.is_empty() {
            params.push(("sort", query.sort.join(",")));
        }
        if !query.fields.is_empty() {
            params.push(("fields", query.fields.join(",")));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }

        let response = self.send(self.client.get(url).query(&params)).await?;
        let list: ListResponse = response
            .json()
            .await
            .map_err(|e| classify_transport(&e, self.timeout))?;
        Ok(list.records)
    }

    async fn get_record(
        &self,
        table: &str,
        id: &str,
    ) -> std::result::Result<Option<Record>, ResilienceError> {
        let url = self.endpoint(&[table, id])?;

        let response = self.execute(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = self.ensure_success(response).await?;
        let record: Record = response
            .json()
            .await
            .map_err(|e| classify_transport(&e, self.timeout))?;
        Ok(Some(record))
    }

    async fn push_engagement(
        &self,
        event: &EngagementEvent,
    ) -> std::result::Result<(), ResilienceError> {
        let url = self.endpoint(&["engagement"])?;
        self.send(self.client.post(url).json(event)).await?;
        Ok(())
    }
}

/// Map a non-success HTTP response to a typed error
pub fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    quota_resource: &str,
) -> ResilienceError {
    let header_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", truncate(body, 200))
    };

    let remaining = header_u64(QUOTA_REMAINING_HEADER);
    if status == StatusCode::PAYMENT_REQUIRED || (status.is_client_error() && remaining == Some(0))
    {
        let limit = header_u64(QUOTA_LIMIT_HEADER).unwrap_or(0);
        return ResilienceError::QuotaExhausted {
            resource: quota_resource.to_string(),
            used: limit,
            limit,
        };
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => ResilienceError::Throttled(detail),
        StatusCode::SERVICE_UNAVAILABLE => ResilienceError::Unavailable(detail),
        s if s.is_server_error() => ResilienceError::Transient(detail),
        _ => ResilienceError::Permanent(detail),
    }
}

/// Map a transport-level failure to a typed error
fn classify_transport(err: &reqwest::Error, timeout: Duration) -> ResilienceError {
    if err.is_timeout() {
        ResilienceError::Timeout(timeout)
    } else if err.is_decode() || err.is_builder() {
        ResilienceError::Permanent(err.to_string())
    } else {
        ResilienceError::Transient(err.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
