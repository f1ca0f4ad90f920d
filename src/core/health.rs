use std::time::Duration;

use hdrhistogram::Histogram;
use tokio::time::Instant;

use super::types::{ConnectionState, ConnectionStats, ErrorRecord, now_epoch_ms};
use super::window::Window;

const MAX_RECENT_ERRORS: usize = 100;
const MAX_ERROR_TEXT_BYTES: usize = 1024;

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_ERROR_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_ERROR_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Counters behind `ConnectionStats`, owned by the connection manager.
///
/// Counters are cumulative over the client's lifetime; `uptime` restarts on every connect.
#[derive(Debug)]
pub struct ConnectionHealth {
    connected_at: Option<Instant>,
    last_frame: Option<Instant>,
    frames_received: u64,
    samples_dispatched: u64,
    decode_failures: u64,
    callback_failures: u64,
    unrouted_frames: u64,
    reconnects: u64,
    recent_errors: Window<ErrorRecord>,
    rtt_histogram: Histogram<u64>,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self {
            connected_at: None,
            last_frame: None,
            frames_received: 0,
            samples_dispatched: 0,
            decode_failures: 0,
            callback_failures: 0,
            unrouted_frames: 0,
            reconnects: 0,
            recent_errors: Window::new(MAX_RECENT_ERRORS),
            rtt_histogram: Histogram::new_with_bounds(1, 60_000_000, 3)
                .expect("histogram bounds are valid"),
        }
    }

    pub fn on_connected(&mut self) {
        let now = Instant::now();
        self.connected_at = Some(now);
        self.last_frame = Some(now);
    }

    pub fn on_disconnected(&mut self) {
        self.connected_at = None;
    }

    pub fn record_frame(&mut self) {
        self.last_frame = Some(Instant::now());
        self.frames_received = self.frames_received.saturating_add(1);
    }

    /// One sample routed to its subscribers, `failed` of which errored or panicked.
    pub fn record_delivery(&mut self, failed: usize) {
        self.samples_dispatched = self.samples_dispatched.saturating_add(1);
        self.callback_failures = self.callback_failures.saturating_add(failed as u64);
    }

    pub fn record_decode_failure(&mut self, error: &str) {
        self.decode_failures = self.decode_failures.saturating_add(1);
        self.record_error("decode", error);
    }

    pub fn record_unrouted(&mut self) {
        self.unrouted_frames = self.unrouted_frames.saturating_add(1);
    }

    pub fn record_error(&mut self, kind: &'static str, error: &str) {
        self.recent_errors.push(ErrorRecord {
            kind,
            message: truncate_string(error),
            at_ms: now_epoch_ms(),
        });
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        let micros = rtt.as_micros().clamp(1, u64::MAX as u128) as u64;
        let _ = self.rtt_histogram.record(micros);
    }

    pub fn increment_reconnect(&mut self) {
        self.reconnects = self.reconnects.saturating_add(1);
    }

    pub fn snapshot(
        &self,
        state: ConnectionState,
        topics: usize,
        subscriptions: usize,
    ) -> ConnectionStats {
        let rtt_samples = self.rtt_histogram.len();
        let (p50, p99) = if rtt_samples == 0 {
            (0, 0)
        } else {
            (
                self.rtt_histogram.value_at_percentile(50.0),
                self.rtt_histogram.value_at_percentile(99.0),
            )
        };

        ConnectionStats {
            state,
            uptime: self
                .connected_at
                .map(|at| at.elapsed())
                .unwrap_or_default(),
            frames_received: self.frames_received,
            samples_dispatched: self.samples_dispatched,
            decode_failures: self.decode_failures,
            callback_failures: self.callback_failures,
            unrouted_frames: self.unrouted_frames,
            reconnects: self.reconnects,
            last_frame_age: self
                .last_frame
                .map(|at| at.elapsed())
                .unwrap_or_default(),
            recent_errors: self.recent_errors.snapshot(),
            heartbeat_rtt_p50_us: p50,
            heartbeat_rtt_p99_us: p99,
            rtt_samples,
            topics,
            subscriptions,
        }
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}
