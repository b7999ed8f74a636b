//! Sync configuration: deployment endpoints, fetch-cache policy and stream
//! reconnection policy.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the remote REST API base URL.
pub const ENV_API_URL: &str = "KANBAN_API_URL";
/// Environment variable holding the WebSocket base URL.
pub const ENV_WS_URL: &str = "KANBAN_WS_URL";
/// Environment variable overriding `query.stale_time_ms`.
pub const ENV_STALE_TIME_MS: &str = "KANBAN_STALE_TIME_MS";
/// Environment variable overriding `query.refetch_interval_ms` (0 disables).
pub const ENV_REFETCH_INTERVAL_MS: &str = "KANBAN_REFETCH_INTERVAL_MS";

/// Top-level configuration for a [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of a decoupled remote API. When set, every resource is
    /// polled over REST because the remote deployment cannot hold
    /// long-lived connections.
    pub api_base_url: Option<String>,
    /// Base URL of the same-origin backend, used for REST calls when no
    /// remote API is configured.
    pub local_base_url: String,
    /// Base URL for stream connections (e.g. `ws://localhost:3001`).
    pub ws_base_url: String,
    /// Fetch-cache policy.
    pub query: QueryPolicy,
    /// Stream reconnection policy.
    pub reconnect: ReconnectPolicy,
    /// Discard the optimistic entry when its mutation request fails.
    pub rollback_on_error: bool,
    /// Timeout for individual REST requests (ms).
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            local_base_url: "http://localhost:3001".to_string(),
            ws_base_url: "ws://localhost:3001".to_string(),
            query: QueryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            rollback_on_error: false,
            request_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Builds a configuration from defaults overridden by `KANBAN_*`
    /// environment variables.
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(url) = env_string(ENV_API_URL) {
            config.api_base_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(url) = env_string(ENV_WS_URL) {
            config.ws_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ms) = env_millis(ENV_STALE_TIME_MS)? {
            config.query.stale_time_ms = ms;
        }
        if let Some(ms) = env_millis(ENV_REFETCH_INTERVAL_MS)? {
            config.query.refetch_interval_ms = (ms > 0).then_some(ms);
        }

        Ok(config)
    }

    /// Whether a remote API base URL is configured (fetch-only deployment).
    pub fn is_remote(&self) -> bool {
        self.api_base_url.is_some()
    }

    /// Base URL for REST calls in this deployment.
    pub fn rest_base_url(&self) -> &str {
        self.api_base_url.as_deref().unwrap_or(&self.local_base_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_millis(name: &str) -> SyncResult<Option<u64>> {
    env_string(name)
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| SyncError::Config(format!("{name}: {e}")))
        })
        .transpose()
}

/// Freshness, retention and retry policy of the snapshot fetch cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryPolicy {
    /// Age after which cached data is eligible for refetch (ms).
    pub stale_time_ms: u64,
    /// Time an unobserved entry is retained before eviction (ms).
    pub gc_time_ms: u64,
    /// Background refetch cadence while observed (ms). `None` disables.
    pub refetch_interval_ms: Option<u64>,
    /// Retry policy for failed fetches.
    pub retry: RetryPolicy,
    /// Refetch stale observed entries when the window regains focus.
    pub refetch_on_window_focus: bool,
    /// Refetch stale observed entries when the network comes back.
    pub refetch_on_reconnect: bool,
    /// Cool-down applied after a 429 without a `Retry-After` header (ms).
    pub rate_limit_cooldown_ms: u64,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            stale_time_ms: 30_000,
            gc_time_ms: 5 * 60_000,
            refetch_interval_ms: None,
            retry: RetryPolicy::default(),
            refetch_on_window_focus: false,
            refetch_on_reconnect: true,
            rate_limit_cooldown_ms: 60_000,
        }
    }
}

impl QueryPolicy {
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    pub fn refetch_interval(&self) -> Option<Duration> {
        self.refetch_interval_ms.map(Duration::from_millis)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }
}

/// Retry policy for failed fetches. 429 responses are never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry (ms); doubles per attempt.
    pub base_delay_ms: u64,
    /// Upper bound on the retry delay (ms).
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff(self.base_delay_ms, self.max_delay_ms, attempt)
    }
}

/// Reconnection policy of the patch stream client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect (ms); doubles per attempt.
    pub base_delay_ms: u64,
    /// Upper bound on the reconnect delay (ms).
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before the stream closes. `None` retries
    /// indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff(self.base_delay_ms, self.max_delay_ms, attempt)
    }
}

fn backoff(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}
