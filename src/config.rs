use std::time::Duration;

/// Fallback worker endpoints used when no configuration is supplied.
pub const DEFAULT_WORKER_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_WORKER_WS_URL: &str = "ws://127.0.0.1:8000/ws";

/// Service configuration, assembled from CLI flags with documented defaults.
///
/// The retry/backoff constants here mirror the worker deployment's observed
/// behavior rather than any measurement; they are configurable defaults, not
/// fixed truths.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the worker's HTTP surface.
    pub worker_base_url: String,
    /// URL of the worker's push stream.
    pub worker_ws_url: String,
    /// Hard ceiling on the submission call itself, separate from the job's
    /// overall wait budget. A hung submission must fail fast.
    pub submit_timeout: Duration,
    /// Transient transport failures tolerated per polling loop before the
    /// job is failed.
    pub poll_retry_budget: u32,
    /// Reconnect attempts for the push channel before degrading to
    /// polling-only mode.
    pub ws_max_reconnects: u32,
    /// Keepalive ping interval on the open push connection.
    pub ws_keepalive: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_base_url: DEFAULT_WORKER_BASE_URL.to_string(),
            worker_ws_url: DEFAULT_WORKER_WS_URL.to_string(),
            submit_timeout: Duration::from_secs(30),
            poll_retry_budget: 5,
            ws_max_reconnects: 10,
            ws_keepalive: Duration::from_secs(30),
        }
    }
}
