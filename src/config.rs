use std::time::Duration;

use crate::core::{DEFAULT_WINDOW_CAPACITY, StreamError, StreamResult, WebSocketBufferConfig};

pub const ENV_URL: &str = "LOADTEST_STREAM_URL";
pub const ENV_HEARTBEAT_MS: &str = "LOADTEST_STREAM_HEARTBEAT_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "LOADTEST_STREAM_CONNECT_TIMEOUT_MS";
pub const ENV_WINDOW: &str = "LOADTEST_STREAM_WINDOW";

/// Settings for a [`StreamClient`](crate::client::StreamClient).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Endpoint used by `connect_configured`.
    pub endpoint: String,
    pub heartbeat_interval: Duration,
    /// Silence tolerated before the connection is declared dead; `None` means 4 x interval.
    pub liveness_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Default capacity for windows created through the client.
    pub window_capacity: usize,
    pub buffers: WebSocketBufferConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8080/ws".to_string(),
            heartbeat_interval: Duration::from_secs(4),
            liveness_timeout: None,
            connect_timeout: Duration::from_secs(10),
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            buffers: WebSocketBufferConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_window_capacity(mut self, capacity: usize) -> Self {
        self.window_capacity = capacity;
        self
    }

    pub fn with_buffers(mut self, buffers: WebSocketBufferConfig) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn effective_liveness_timeout(&self) -> Duration {
        self.liveness_timeout
            .unwrap_or_else(|| self.heartbeat_interval.saturating_mul(4))
    }

    /// Defaults overridden by `LOADTEST_STREAM_*` environment variables.
    pub fn from_env() -> StreamResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StreamResult<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_URL).filter(|url| !url.trim().is_empty()) {
            config.endpoint = url.trim().to_string();
        }
        if let Some(ms) = parse_var(&lookup, ENV_HEARTBEAT_MS)? {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, ENV_CONNECT_TIMEOUT_MS)? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(window) = parse_var(&lookup, ENV_WINDOW)? {
            config.window_capacity = window as usize;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(StreamError::InvalidState(
                "heartbeat interval must be non-zero".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(StreamError::InvalidState(
                "connect timeout must be non-zero".into(),
            ));
        }
        if self.window_capacity == 0 {
            return Err(StreamError::InvalidState(
                "window capacity must be non-zero".into(),
            ));
        }
        self.buffers.validate()
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> StreamResult<Option<u64>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|err| StreamError::InvalidState(format!("{key}={raw:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_console_settings() {
        let config = StreamConfig::default();
        assert_eq!(config.endpoint, "ws://localhost:8080/ws");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(4));
        assert_eq!(config.effective_liveness_timeout(), Duration::from_secs(16));
        assert_eq!(config.window_capacity, 20);
    }

    #[test]
    fn env_overrides_apply() {
        let config = StreamConfig::from_lookup(lookup(&[
            (ENV_URL, "wss://console.example/ws"),
            (ENV_HEARTBEAT_MS, "1000"),
            (ENV_CONNECT_TIMEOUT_MS, " 2500 "),
            (ENV_WINDOW, "60"),
        ]))
        .unwrap();
        assert_eq!(config.endpoint, "wss://console.example/ws");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.window_capacity, 60);
    }

    #[test]
    fn env_rejects_garbage_and_zero_interval() {
        assert!(StreamConfig::from_lookup(lookup(&[(ENV_WINDOW, "lots")])).is_err());
        assert!(StreamConfig::from_lookup(lookup(&[(ENV_HEARTBEAT_MS, "0")])).is_err());
    }

    #[test]
    fn rejects_empty_windows_and_undersized_write_limit() {
        assert!(StreamConfig::from_lookup(lookup(&[(ENV_WINDOW, "0")])).is_err());

        let buffers = WebSocketBufferConfig {
            max_write_buffer_bytes: WebSocketBufferConfig::default().write_buffer_bytes,
            ..WebSocketBufferConfig::default()
        };
        let err = StreamConfig::default()
            .with_buffers(buffers)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_write_buffer_bytes"), "{err}");
    }

    #[test]
    fn explicit_liveness_timeout_wins() {
        let config = StreamConfig::default().with_liveness_timeout(Duration::from_secs(3));
        assert_eq!(config.effective_liveness_timeout(), Duration::from_secs(3));
    }
}
