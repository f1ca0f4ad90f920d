//! Reusable test utilities for driving a `StreamClient` without a real socket.
//!
//! [`MockTransport`] hands every connect attempt to a [`MockServer`], which scripts the
//! outcome (accept, refuse, hang) and yields a [`MockConnection`] per accepted socket so tests
//! can read control frames, push envelopes and drop the socket.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Sink, Stream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::{
    ControlFrame, ReconnectPolicy, StreamError, StreamResult, WebSocketBufferConfig, WsFrame,
    encode_envelope,
};
use crate::transport::{WsTransport, WsTransportConnectFuture};

/// Scripted result of one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse(String),
    /// Never completes; exercises the connect timeout.
    Hang,
}

struct MockShared {
    script: Mutex<VecDeque<ConnectOutcome>>,
    attempts: Mutex<Vec<(Instant, String)>>,
    accepted_tx: mpsc::UnboundedSender<MockConnection>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A transport that uses in-memory channels so tests can emulate server behavior.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
    auto_pong: bool,
}

impl MockTransport {
    /// Build a transport + server control pair.
    pub fn channel_pair() -> (Self, MockServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            script: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
            accepted_tx,
        });
        (
            Self {
                shared: Arc::clone(&shared),
                auto_pong: false,
            },
            MockServer {
                accepted_rx,
                shared,
            },
        )
    }

    /// Report that the transport answers pings itself, as tungstenite does. The mock still
    /// sends nothing on its own.
    pub fn replying_to_pings(mut self) -> Self {
        self.auto_pong = true;
        self
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        url: String,
        _buffers: WebSocketBufferConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            lock(&shared.attempts).push((Instant::now(), url));
            let outcome = lock(&shared.script)
                .pop_front()
                .unwrap_or(ConnectOutcome::Accept);

            match outcome {
                ConnectOutcome::Accept => {
                    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
                    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                    let stalled = Arc::new(AtomicBool::new(false));
                    let connection = MockConnection {
                        outbound_rx: sent_rx,
                        inbound_tx: Some(inbound_tx),
                        stalled: Arc::clone(&stalled),
                    };
                    shared.accepted_tx.send(connection).map_err(|_| {
                        StreamError::ConnectionFailed("mock server dropped".to_string())
                    })?;
                    Ok((
                        MockReader { rx: inbound_rx },
                        MockWriter { sent_tx, stalled },
                    ))
                }
                ConnectOutcome::Refuse(reason) => Err(StreamError::ConnectionFailed(reason)),
                ConnectOutcome::Hang => futures_util::future::pending().await,
            }
        })
    }

    fn replies_to_pings(&self) -> bool {
        self.auto_pong
    }
}

/// Error surface for operations on [`MockConnection`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    /// The inbound socket side was intentionally dropped.
    SocketDropped,
    /// The client side is no longer reading this connection.
    ChannelClosed,
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::ChannelClosed => f.write_str("mock client channel is closed"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Server-side test handle paired with [`MockTransport`].
pub struct MockServer {
    accepted_rx: mpsc::UnboundedReceiver<MockConnection>,
    shared: Arc<MockShared>,
}

impl MockServer {
    /// Queue the outcome of a future connect attempt. Unscripted attempts are accepted.
    pub fn script(&self, outcome: ConnectOutcome) {
        lock(&self.shared.script).push_back(outcome);
    }

    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> Option<MockConnection> {
        self.accepted_rx.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<MockConnection> {
        tokio::time::timeout(timeout, self.accepted_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Instants of every connect attempt so far, accepted or not.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        lock(&self.shared.attempts)
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn attempt_count(&self) -> usize {
        lock(&self.shared.attempts).len()
    }

    /// URL passed to the most recent connect attempt.
    pub fn last_url(&self) -> Option<String> {
        lock(&self.shared.attempts).last().map(|(_, url)| url.clone())
    }
}

/// One accepted in-memory socket.
pub struct MockConnection {
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<WsFrame>>,
    stalled: Arc<AtomicBool>,
}

impl MockConnection {
    /// Receive a frame written by the client.
    pub async fn recv_outbound(&mut self) -> Option<WsFrame> {
        self.outbound_rx.recv().await
    }

    /// Receive a frame with a timeout.
    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Next subscribe/unsubscribe frame, skipping heartbeat traffic.
    pub async fn recv_control(&mut self) -> Option<ControlFrame> {
        loop {
            match self.outbound_rx.recv().await? {
                WsFrame::Text(bytes) | WsFrame::Binary(bytes) => {
                    if let Ok(control) = ControlFrame::decode(&bytes) {
                        return Some(control);
                    }
                }
                _ => continue,
            }
        }
    }

    pub async fn recv_control_timeout(&mut self, timeout: Duration) -> Option<ControlFrame> {
        tokio::time::timeout(timeout, self.recv_control())
            .await
            .unwrap_or_default()
    }

    /// Push an inbound frame to the client.
    pub fn send_inbound(&self, frame: WsFrame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(frame).map_err(|_| MockServerError::ChannelClosed)
    }

    /// Push a UTF-8 payload as websocket text.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), MockServerError> {
        self.send_inbound(WsFrame::text(text))
    }

    /// Push a `{"topic", "body"}` envelope with `body_json` string-encoded, as the backend does.
    pub fn send_envelope(&self, topic: &str, body_json: &str) -> StreamResult<()> {
        let frame = encode_envelope(topic, body_json)?;
        self.send_inbound(frame)
            .map_err(|err| StreamError::ConnectionFailed(err.to_string()))
    }

    /// Stop accepting client writes: every later send stays pending, like a full socket.
    pub fn stall_writes(&self) {
        self.stalled.store(true, Ordering::Release);
    }

    /// Simulate server-side socket drop by closing the inbound channel.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<WsFrame>,
}

impl Stream for MockReader {
    type Item = Result<WsFrame, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.rx).poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Writer side for [`MockTransport`].
pub struct MockWriter {
    sent_tx: mpsc::UnboundedSender<WsFrame>,
    stalled: Arc<AtomicBool>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.stalled.load(Ordering::Acquire) {
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        self.get_mut()
            .sent_tx
            .send(item)
            .map_err(|_| StreamError::TransportError {
                context: "mock_transport_write",
                error: "mock outbound channel closed".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Reconnect policy that never retries: the first failure moves the client to `Failed`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReconnect;

impl ReconnectPolicy for NoReconnect {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}
