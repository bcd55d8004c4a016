/*!
 * Tollgate - resilient access to quota-limited upstream services
 *
 * Wraps every call to an unreliable records service with:
 * - A circuit breaker that answers with a safe fallback while the upstream is failing
 * - Daily quota ceilings that refuse calls before the upstream does
 * - A shared degradation level that switches to cheaper requests and cached data
 * - Bounded exponential backoff with per-request timeouts
 *
 * The primitives live in `tollgate-core-resilience`; this crate adds
 * configuration, logging, the HTTP upstream and the composed client.
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod upstream;

// Re-export commonly used types
pub use client::{HealthReport, ResilientClient};
pub use config::{LogLevel, TollgateConfig};
pub use error::{Result, TollgateError};
pub use upstream::{EngagementEvent, HttpUpstream, ListQuery, Record, Upstream};

pub use tollgate_core_resilience as resilience;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
