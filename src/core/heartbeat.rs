use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::frame::WsFrame;

/// Result of offering an inbound frame to the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatReply {
    /// Not a heartbeat frame; route it normally.
    NotHeartbeat,
    /// Pong for our ping, with the round trip when a ping was outstanding.
    PongReceived(Option<Duration>),
    /// Server ping that must be answered with this frame.
    Reply(WsFrame),
}

/// Protocol-level ping/pong keepalive with inbound liveness tracking.
///
/// Any inbound frame, data or control, counts as liveness. The connection is considered dead
/// once nothing has arrived for `liveness_timeout`.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    liveness_timeout: Duration,
    last_ping: Option<Instant>,
    last_inbound: Instant,
    /// The transport answers server pings itself.
    auto_pong: bool,
}

impl Heartbeat {
    pub fn new(interval: Duration, liveness_timeout: Duration) -> Self {
        Self {
            interval,
            liveness_timeout,
            last_ping: None,
            last_inbound: Instant::now(),
            auto_pong: false,
        }
    }

    /// Leave server pings to the transport instead of answering them here.
    pub fn with_auto_pong(mut self, auto_pong: bool) -> Self {
        self.auto_pong = auto_pong;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Start a fresh liveness period, used when a transport opens.
    pub fn reset(&mut self) {
        self.last_ping = None;
        self.last_inbound = Instant::now();
    }

    pub fn create_ping(&mut self) -> WsFrame {
        self.last_ping = Some(Instant::now());
        WsFrame::Ping(Bytes::new())
    }

    pub fn handle_inbound(&mut self, frame: &WsFrame) -> HeartbeatReply {
        let now = Instant::now();
        self.last_inbound = now;
        match frame {
            WsFrame::Pong(_) => {
                let rtt = self
                    .last_ping
                    .take()
                    .map(|sent| now.saturating_duration_since(sent));
                HeartbeatReply::PongReceived(rtt)
            }
            WsFrame::Ping(_) if self.auto_pong => HeartbeatReply::NotHeartbeat,
            WsFrame::Ping(payload) => HeartbeatReply::Reply(WsFrame::Pong(payload.clone())),
            _ => HeartbeatReply::NotHeartbeat,
        }
    }

    /// How long the connection has been silent, if that exceeds the liveness timeout.
    pub fn overdue(&self) -> Option<Duration> {
        let silent_for = self.last_inbound.elapsed();
        (silent_for > self.liveness_timeout).then_some(silent_for)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pong_reports_round_trip_once() {
        let mut hb = Heartbeat::new(Duration::from_secs(4), Duration::from_secs(16));
        assert_eq!(hb.create_ping(), WsFrame::Ping(Bytes::new()));
        tokio::time::advance(Duration::from_millis(30)).await;

        let reply = hb.handle_inbound(&WsFrame::Pong(Bytes::new()));
        assert_eq!(
            reply,
            HeartbeatReply::PongReceived(Some(Duration::from_millis(30)))
        );
        assert_eq!(
            hb.handle_inbound(&WsFrame::Pong(Bytes::new())),
            HeartbeatReply::PongReceived(None)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn server_ping_is_echoed() {
        let mut hb = Heartbeat::new(Duration::from_secs(4), Duration::from_secs(16));
        let ping = WsFrame::Ping(Bytes::from_static(b"hb-1"));
        assert_eq!(
            hb.handle_inbound(&ping),
            HeartbeatReply::Reply(WsFrame::Pong(Bytes::from_static(b"hb-1")))
        );
        assert_eq!(
            hb.handle_inbound(&WsFrame::text_static("{}")),
            HeartbeatReply::NotHeartbeat
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auto_pong_transport_gets_no_manual_reply() {
        let mut hb =
            Heartbeat::new(Duration::from_secs(1), Duration::from_secs(3)).with_auto_pong(true);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            hb.handle_inbound(&WsFrame::Ping(Bytes::from_static(b"hb-2"))),
            HeartbeatReply::NotHeartbeat
        );
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(hb.overdue().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn any_inbound_frame_extends_liveness() {
        let mut hb = Heartbeat::new(Duration::from_secs(1), Duration::from_secs(3));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(hb.overdue().is_none());

        hb.handle_inbound(&WsFrame::text_static("{}"));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(hb.overdue().is_none());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(hb.overdue(), Some(Duration::from_millis(3500)));

        hb.reset();
        assert!(hb.overdue().is_none());
    }
}
