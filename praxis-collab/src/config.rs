//! Client configuration.

use std::time::Duration;

/// Configuration for the collaboration client.
///
/// All knobs are optional in practice — `Default` reproduces the values the
/// production deployment runs with.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Base server URL (http/https). The WebSocket endpoint and the
    /// credential endpoint are derived from it.
    pub server_url: String,
    /// Whether the transport reconnects automatically after an unexpected
    /// connection loss.
    pub reconnection: bool,
    /// Maximum reconnection attempts before giving up.
    pub reconnection_attempts: u32,
    /// Delay between reconnection attempts.
    pub reconnection_delay: Duration,
    /// Handshake timeout — `connect` rejects if no acknowledgement arrives
    /// within this window.
    pub connect_timeout: Duration,
    /// Whether the token manager schedules background credential refreshes.
    pub auto_refresh_token: bool,
    /// How long before expiry the scheduled refresh fires.
    pub token_refresh_threshold: Duration,
    /// Client-side credential lifetime. The credential endpoint returns no
    /// TTL, so the client fabricates one.
    pub token_ttl: Duration,
    /// Trailing-edge throttle window for cursor broadcasts.
    pub throttle_cursor: Duration,
    /// Trailing-edge throttle window for selection broadcasts.
    pub throttle_selection: Duration,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:9090".to_string(),
            reconnection: true,
            reconnection_attempts: 5,
            reconnection_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(10),
            auto_refresh_token: true,
            token_refresh_threshold: Duration::from_secs(300),
            token_ttl: Duration::from_secs(3600),
            throttle_cursor: Duration::from_millis(50),
            throttle_selection: Duration::from_millis(200),
        }
    }
}

impl CollabConfig {
    /// Create a configuration for the given server URL, defaults elsewhere.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// The WebSocket URL derived from `server_url` (http → ws, https → wss).
    pub fn websocket_url(&self) -> String {
        websocket_url(&self.server_url)
    }
}

/// Map an http(s) URL to its ws(s) equivalent. URLs already carrying a
/// WebSocket scheme pass through unchanged.
pub(crate) fn websocket_url(server_url: &str) -> String {
    if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        server_url.to_string()
    }
}
