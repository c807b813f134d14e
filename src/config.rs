use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Base configuration for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// WebSocket endpoint for the chat channel.
    pub endpoint: String,
    /// Origin header sent during the WebSocket upgrade.
    pub origin: String,
    /// Timeout for the initial connect + handshake.
    pub connect_timeout: Duration,
    /// Default timeout for tagged IQ queries.
    pub query_timeout: Duration,
    /// Timeout for pre-key uploads.
    pub upload_timeout: Duration,
    /// Interval between keep-alive pings.
    pub keep_alive_interval: Duration,
    /// Minimum spacing between outbound WebSocket sends.
    pub send_spacing: Duration,
    /// Maximum reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Ceiling for the reconnect backoff delay.
    pub max_reconnect_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "wss://web.whatsapp.com/ws/chat".into(),
            origin: "https://web.whatsapp.com".into(),
            connect_timeout: Duration::from_secs(600),
            query_timeout: Duration::from_secs(60),
            upload_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(30),
            send_spacing: Duration::from_millis(50),
            max_reconnect_attempts: 5,
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Override the chat endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Override the default query timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Override the keep-alive interval.
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Override the reconnect attempt cap.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }
}
