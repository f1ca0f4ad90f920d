use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience result alias for streaming operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Error type subscriber callbacks may return. It is logged and counted, never propagated.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result returned by subscriber callbacks.
pub type CallbackResult = Result<(), CallbackError>;

/// Canonical error surface shared across the client.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Timeout: {context}")]
    Timeout { context: String },

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Actor error: {0}")]
    ActorError(String),
}

/// Lifecycle of the single logical connection owned by a connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// States in which no transport is open and no retry timer is armed.
    pub fn is_idle(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a live (or opening) transport was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    OpenFailed { error: String },
    OpenTimeout { after: Duration },
    ReadFailure { error: String },
    RemoteClosed { code: Option<u16>, reason: String },
    StreamEnded,
    WriteFailure { context: &'static str, error: String },
    HeartbeatTimeout { silent_for: Duration },
}

impl DisconnectCause {
    /// Short stable label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            DisconnectCause::OpenFailed { .. } => "open_failed",
            DisconnectCause::OpenTimeout { .. } => "open_timeout",
            DisconnectCause::ReadFailure { .. } => "read_failure",
            DisconnectCause::RemoteClosed { .. } => "remote_closed",
            DisconnectCause::StreamEnded => "stream_ended",
            DisconnectCause::WriteFailure { .. } => "write_failure",
            DisconnectCause::HeartbeatTimeout { .. } => "heartbeat_timeout",
        }
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::OpenFailed { error } => write!(f, "open failed: {error}"),
            DisconnectCause::OpenTimeout { after } => write!(f, "open timed out after {after:?}"),
            DisconnectCause::ReadFailure { error } => write!(f, "read failed: {error}"),
            DisconnectCause::RemoteClosed { code, reason } => match code {
                Some(code) => write!(f, "closed by server (code={code}, reason={reason})"),
                None => write!(f, "closed by server"),
            },
            DisconnectCause::StreamEnded => f.write_str("stream ended"),
            DisconnectCause::WriteFailure { context, error } => {
                write!(f, "write failed ({context}): {error}")
            }
            DisconnectCause::HeartbeatTimeout { silent_for } => {
                write!(f, "no inbound traffic for {silent_for:?}")
            }
        }
    }
}

/// Transport-independent buffer sizing parameters used for websocket configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WebSocketBufferConfig {
    pub read_buffer_bytes: usize,
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for WebSocketBufferConfig {
    fn default() -> Self {
        Self {
            // Metric frames are small JSON documents; 1 MiB leaves ample headroom.
            read_buffer_bytes: 128 << 10,
            write_buffer_bytes: 64 << 10,
            max_write_buffer_bytes: 256 << 10,
            max_message_bytes: 1 << 20,
            max_frame_bytes: 1 << 20,
        }
    }
}

impl WebSocketBufferConfig {
    /// tungstenite refuses (by panicking) a write limit that does not exceed the write buffer.
    pub fn validate(&self) -> StreamResult<()> {
        if self.max_write_buffer_bytes <= self.write_buffer_bytes {
            return Err(StreamError::InvalidState(format!(
                "max_write_buffer_bytes ({}) must exceed write_buffer_bytes ({})",
                self.max_write_buffer_bytes, self.write_buffer_bytes
            )));
        }
        Ok(())
    }
}

/// One entry of the bounded recent-error log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorRecord {
    /// `DisconnectCause::kind` or `"decode"`.
    pub kind: &'static str,
    pub message: String,
    pub at_ms: i64,
}

/// Point-in-time view of the connection and its dispatch counters.
#[derive(Clone, Debug)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    /// Time since the current transport was established; zero when not connected.
    pub uptime: Duration,
    pub frames_received: u64,
    pub samples_dispatched: u64,
    pub decode_failures: u64,
    pub callback_failures: u64,
    pub unrouted_frames: u64,
    pub reconnects: u64,
    pub last_frame_age: Duration,
    /// Most recent failures, oldest first.
    pub recent_errors: Vec<ErrorRecord>,
    pub heartbeat_rtt_p50_us: u64,
    pub heartbeat_rtt_p99_us: u64,
    pub rtt_samples: u64,
    pub topics: usize,
    pub subscriptions: usize,
}

/// Best-effort current time as Unix epoch milliseconds.
#[inline]
pub fn now_epoch_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_states_are_disconnected_and_failed() {
        assert!(ConnectionState::Disconnected.is_idle());
        assert!(ConnectionState::Failed.is_idle());
        assert!(!ConnectionState::Reconnecting.is_idle());
        assert!(!ConnectionState::Connecting.is_idle());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn disconnect_cause_renders_for_logs() {
        let cause = DisconnectCause::RemoteClosed {
            code: Some(1001),
            reason: "going away".into(),
        };
        assert_eq!(cause.kind(), "remote_closed");
        assert_eq!(
            cause.to_string(),
            "closed by server (code=1001, reason=going away)"
        );
        assert_eq!(
            DisconnectCause::HeartbeatTimeout {
                silent_for: Duration::from_secs(16)
            }
            .kind(),
            "heartbeat_timeout"
        );
    }

    #[test]
    fn write_limit_must_exceed_write_buffer() {
        assert!(WebSocketBufferConfig::default().validate().is_ok());
        let equal = WebSocketBufferConfig {
            max_write_buffer_bytes: 64 << 10,
            write_buffer_bytes: 64 << 10,
            ..WebSocketBufferConfig::default()
        };
        assert!(matches!(equal.validate(), Err(StreamError::InvalidState(_))));
    }
}
