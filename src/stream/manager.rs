//! Connection manager actor.
//!
//! The actor owns the single logical connection: its state machine, the write half of the
//! transport, the subscription registry and the router. Socket reads, transport opens, retry
//! timers and heartbeat ticks run in spawned tasks that report back through the mailbox, so
//! every state change happens one event at a time.
//!
//! Each transport open bumps a generation counter. Events tagged with an older generation
//! (late frames, late close notifications, late retry timers) are ignored.

use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use kameo::error::ActorStopReason;
use kameo::prelude::{
    Actor, ActorRef, Context, Message as KameoMessage, PanicError, WeakActorRef,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::registry::{SampleCallback, SubscriptionHandle, SubscriptionRegistry, panic_message};
use super::router::{MessageRouter, record_outcome};
use crate::config::StreamConfig;
use crate::core::{
    ConnectionHealth, ConnectionState, ConnectionStats, ControlFrame, DisconnectCause, Heartbeat,
    HeartbeatReply, ReconnectPolicy, StreamError, StreamResult, Topic, WsFrame,
};
use crate::transport::WsTransport;

/// Observer notified on every connection state transition.
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync + 'static>;

/// Upper bound on the best-effort close handshake during `disconnect`.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Arguments passed when spawning a connection manager.
pub struct ConnectionManagerArgs<T, P> {
    pub config: StreamConfig,
    pub transport: T,
    pub policy: P,
    pub state_tx: watch::Sender<ConnectionState>,
}

pub struct ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    config: StreamConfig,
    transport: T,
    policy: P,
    actor_ref: ActorRef<Self>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    on_state_change: Option<StateCallback>,
    endpoint: Option<String>,
    registry: SubscriptionRegistry,
    router: MessageRouter,
    health: ConnectionHealth,
    heartbeat: Heartbeat,
    writer: Option<T::Writer>,
    open_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    generation: u64,
    /// Failed attempts since the last successful open (1-based once a failure occurs).
    attempt: u32,
}

impl<T, P> Actor for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Args = ConnectionManagerArgs<T, P>;
    type Error = StreamError;

    fn name() -> &'static str {
        "ConnectionManager"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> StreamResult<Self> {
        let ConnectionManagerArgs {
            config,
            transport,
            policy,
            state_tx,
        } = args;
        config.validate()?;

        let heartbeat = Heartbeat::new(
            config.heartbeat_interval,
            config.effective_liveness_timeout(),
        )
        .with_auto_pong(transport.replies_to_pings());
        let router = MessageRouter::new(config.buffers.max_message_bytes);
        state_tx.send_replace(ConnectionState::Disconnected);

        Ok(Self {
            config,
            transport,
            policy,
            actor_ref,
            state: ConnectionState::Disconnected,
            state_tx,
            on_state_change: None,
            endpoint: None,
            registry: SubscriptionRegistry::new(),
            router,
            health: ConnectionHealth::new(),
            heartbeat,
            writer: None,
            open_task: None,
            reader_task: None,
            heartbeat_task: None,
            retry_task: None,
            generation: 0,
            attempt: 0,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> StreamResult<()> {
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        self.teardown_transport();
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: PanicError,
    ) -> impl std::future::Future<Output = Result<ControlFlow<ActorStopReason>, Self::Error>> + Send
    {
        async move {
            error!(error = ?err, "ConnectionManager panicked");
            Ok(ControlFlow::Break(ActorStopReason::Panicked(err)))
        }
    }
}

/// Open the connection to `endpoint`. No-op while connected or connecting.
pub struct Connect {
    pub endpoint: String,
    /// Replaces the previous observer when `Some`.
    pub on_state_change: Option<StateCallback>,
}

/// Close the connection and cancel any pending retry. Subscriptions are kept.
pub struct Disconnect;

pub struct Subscribe {
    pub handle: SubscriptionHandle,
    pub topic: Topic,
    pub callback: SampleCallback,
}

pub struct Unsubscribe {
    pub handle: SubscriptionHandle,
}

pub struct GetConnectionState;

pub struct GetConnectionStats;

/// A transport finished opening.
pub struct TransportOpened<T: WsTransport> {
    pub(crate) generation: u64,
    pub(crate) reader: T::Reader,
    pub(crate) writer: T::Writer,
}

pub struct TransportOpenFailed {
    pub(crate) generation: u64,
    pub(crate) cause: DisconnectCause,
}

pub struct InboundFrame {
    pub(crate) generation: u64,
    pub(crate) frame: WsFrame,
}

pub struct TransportClosed {
    pub(crate) generation: u64,
    pub(crate) cause: DisconnectCause,
}

pub struct RetryConnect {
    pub(crate) generation: u64,
}

pub struct HeartbeatTick {
    pub(crate) generation: u64,
}

impl<T, P> KameoMessage<Connect> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = ();

    async fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                debug!(state = %self.state, "connect ignored; connection already active");
                return;
            }
            ConnectionState::Reconnecting => {
                if let Some(task) = self.retry_task.take() {
                    task.abort();
                }
                debug!(attempt = self.attempt, "connect while reconnecting; retrying now");
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }

        self.endpoint = Some(msg.endpoint);
        if let Some(callback) = msg.on_state_change {
            self.on_state_change = Some(callback);
        }
        self.attempt = 0;
        self.begin_attempt();
    }
}

impl<T, P> KameoMessage<Disconnect> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if let Some(task) = self.retry_task.take() {
            task.abort();
            debug!(attempt = self.attempt, "pending reconnect cancelled");
        }

        // The close handshake runs off the mailbox so queued requests are not held up by it.
        if let Some(mut writer) = self.writer.take() {
            tokio::spawn(async move {
                let close = async {
                    writer.send(WsFrame::client_close()).await?;
                    writer.close().await
                };
                match tokio::time::timeout(CLOSE_GRACE, close).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => debug!(error = %err, "close frame not delivered"),
                    Err(_) => debug!("close handshake timed out"),
                }
            });
        }

        let previous = self.state;
        self.teardown_transport();
        self.generation = self.generation.wrapping_add(1);
        self.attempt = 0;
        self.set_state(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!(
                endpoint = %self.endpoint_label(),
                from = %previous,
                topics = self.registry.topic_count(),
                "metrics stream disconnected"
            );
        }
    }
}

impl<T, P> KameoMessage<Subscribe> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = ();

    async fn handle(&mut self, msg: Subscribe, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let Subscribe {
            handle,
            topic,
            callback,
        } = msg;
        let first = self.registry.insert(handle, topic.clone(), callback);
        debug!(%handle, %topic, first, state = %self.state, "subscription registered");

        if first && self.state == ConnectionState::Connected {
            self.send_control_or_fail("subscribe", ControlFrame::Subscribe { topic })
                .await;
        }
    }
}

impl<T, P> KameoMessage<Unsubscribe> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: Unsubscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let Some(removed) = self.registry.remove(msg.handle) else {
            debug!(handle = %msg.handle, "unsubscribe for unknown handle ignored");
            return;
        };
        debug!(
            handle = %msg.handle,
            topic = %removed.topic,
            last = removed.topic_now_empty,
            "subscription removed"
        );

        if removed.topic_now_empty && self.state == ConnectionState::Connected {
            self.send_control_or_fail(
                "unsubscribe",
                ControlFrame::Unsubscribe {
                    topic: removed.topic,
                },
            )
            .await;
        }
    }
}

impl<T, P> KameoMessage<GetConnectionState> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = StreamResult<ConnectionState>;

    async fn handle(
        &mut self,
        _msg: GetConnectionState,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.state)
    }
}

impl<T, P> KameoMessage<GetConnectionStats> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = StreamResult<ConnectionStats>;

    async fn handle(
        &mut self,
        _msg: GetConnectionStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.health.snapshot(
            self.state,
            self.registry.topic_count(),
            self.registry.len(),
        ))
    }
}

impl<T, P> KameoMessage<TransportOpened<T>> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: TransportOpened<T>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(
                generation = msg.generation,
                current = self.generation,
                state = %self.state,
                "discarding transport from superseded attempt"
            );
            return;
        }
        self.on_transport_opened(msg.reader, msg.writer).await;
    }
}

impl<T, P> KameoMessage<TransportOpenFailed> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: TransportOpenFailed,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(generation = msg.generation, cause = %msg.cause, "ignoring stale open failure");
            return;
        }
        self.open_task = None;
        self.fail_connection(msg.cause);
    }
}

impl<T, P> KameoMessage<InboundFrame> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: InboundFrame,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation || self.state != ConnectionState::Connected {
            debug!(generation = msg.generation, "dropping frame from superseded connection");
            return;
        }
        self.process_inbound(msg.frame).await;
    }
}

impl<T, P> KameoMessage<TransportClosed> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: TransportClosed,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation {
            debug!(generation = msg.generation, cause = %msg.cause, "ignoring stale close");
            return;
        }
        self.fail_connection(msg.cause);
    }
}

impl<T, P> KameoMessage<RetryConnect> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: RetryConnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation || self.state != ConnectionState::Reconnecting {
            debug!(generation = msg.generation, "ignoring stale reconnect timer");
            return;
        }
        self.retry_task = None;
        self.begin_attempt();
    }
}

impl<T, P> KameoMessage<HeartbeatTick> for ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: HeartbeatTick,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation || self.state != ConnectionState::Connected {
            return;
        }

        if let Some(silent_for) = self.heartbeat.overdue() {
            self.fail_connection(DisconnectCause::HeartbeatTimeout { silent_for });
            return;
        }

        let ping = self.heartbeat.create_ping();
        if let Err(err) = self.send_frame(ping).await {
            self.fail_connection(DisconnectCause::WriteFailure {
                context: "ping",
                error: err.to_string(),
            });
        }
    }
}

impl<T, P> ConnectionManager<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    fn endpoint_label(&self) -> &str {
        self.endpoint.as_deref().unwrap_or("<unset>")
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        let previous = std::mem::replace(&mut self.state, next);
        self.state_tx.send_replace(next);
        debug!(from = %previous, to = %next, "connection state changed");

        if let Some(callback) = self.on_state_change.as_ref()
            && catch_unwind(AssertUnwindSafe(|| callback(next))).is_err()
        {
            warn!(state = %next, "state change callback panicked");
        }
    }

    fn begin_attempt(&mut self) {
        let Some(endpoint) = self.endpoint.clone() else {
            warn!("connect attempt without an endpoint");
            return;
        };
        if let Some(task) = self.open_task.take() {
            task.abort();
        }

        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);
        debug!(endpoint = %endpoint, generation, attempt = self.attempt, "opening transport");

        let transport = self.transport.clone();
        let buffers = self.config.buffers;
        let connect_timeout = self.config.connect_timeout;
        let actor_ref = self.actor_ref.clone();

        // A panicking transport must still report back, or the manager would sit in
        // `Connecting` with no way out.
        self.open_task = Some(tokio::spawn(async move {
            let open = AssertUnwindSafe(async move { transport.connect(endpoint, buffers).await })
                .catch_unwind();
            let cause = match tokio::time::timeout(connect_timeout, open).await {
                Ok(Ok(Ok((reader, writer)))) => {
                    let _ = actor_ref
                        .tell(TransportOpened::<T> {
                            generation,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                    return;
                }
                Ok(Ok(Err(err))) => DisconnectCause::OpenFailed {
                    error: err.to_string(),
                },
                Ok(Err(payload)) => {
                    let message = panic_message(&*payload);
                    error!(generation, panic = message, "transport connect panicked");
                    DisconnectCause::OpenFailed {
                        error: format!("transport panicked: {message}"),
                    }
                }
                Err(_) => DisconnectCause::OpenTimeout {
                    after: connect_timeout,
                },
            };
            let _ = actor_ref
                .tell(TransportOpenFailed { generation, cause })
                .send()
                .await;
        }));
    }

    async fn on_transport_opened(&mut self, reader: T::Reader, writer: T::Writer) {
        let generation = self.generation;
        self.open_task = None;
        self.attempt = 0;
        self.writer = Some(writer);
        self.health.on_connected();
        self.heartbeat.reset();
        self.spawn_reader(reader, generation);
        self.start_heartbeat(generation);
        self.set_state(ConnectionState::Connected);
        info!(
            endpoint = %self.endpoint_label(),
            generation,
            topics = self.registry.topic_count(),
            "metrics stream connected"
        );

        let topics: Vec<Topic> = self.registry.topics().cloned().collect();
        for topic in topics {
            if !self
                .send_control_or_fail("replay", ControlFrame::Subscribe { topic })
                .await
            {
                return;
            }
        }
    }

    fn spawn_reader(&mut self, mut reader: T::Reader, generation: u64) {
        let actor_ref = self.actor_ref.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let cause = loop {
                match reader.next().await {
                    Some(Ok(frame)) => {
                        if actor_ref
                            .tell(InboundFrame { generation, frame })
                            .send()
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        break DisconnectCause::ReadFailure {
                            error: err.to_string(),
                        };
                    }
                    None => break DisconnectCause::StreamEnded,
                }
            };
            let _ = actor_ref
                .tell(TransportClosed { generation, cause })
                .send()
                .await;
        }));
    }

    fn start_heartbeat(&mut self, generation: u64) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }

        let interval = self.heartbeat.interval();
        let actor_ref = self.actor_ref.clone();
        self.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if actor_ref
                    .tell(HeartbeatTick { generation })
                    .send()
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
    }

    async fn process_inbound(&mut self, frame: WsFrame) {
        self.health.record_frame();
        match self.heartbeat.handle_inbound(&frame) {
            HeartbeatReply::Reply(pong) => {
                if let Err(err) = self.send_frame(pong).await {
                    self.fail_connection(DisconnectCause::WriteFailure {
                        context: "pong",
                        error: err.to_string(),
                    });
                }
            }
            HeartbeatReply::PongReceived(rtt) => {
                if let Some(rtt) = rtt {
                    self.health.record_rtt(rtt);
                }
            }
            HeartbeatReply::NotHeartbeat => match &frame {
                WsFrame::Text(bytes) | WsFrame::Binary(bytes) => {
                    let outcome = self.router.dispatch(bytes, &mut self.registry);
                    record_outcome(&outcome, &mut self.health);
                }
                WsFrame::Close(close) => {
                    let (code, reason) = match close {
                        Some(close) => (
                            Some(close.code),
                            String::from_utf8_lossy(&close.reason).into_owned(),
                        ),
                        None => (None, String::new()),
                    };
                    self.fail_connection(DisconnectCause::RemoteClosed { code, reason });
                }
                WsFrame::Ping(_) | WsFrame::Pong(_) => {}
            },
        }
    }

    async fn send_frame(&mut self, frame: WsFrame) -> StreamResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(StreamError::InvalidState("no open transport".into()));
        };
        writer.send(frame).await
    }

    /// Send a control frame; a write error fails the connection. Returns whether it was sent.
    async fn send_control_or_fail(&mut self, context: &'static str, control: ControlFrame) -> bool {
        let result = match control.encode() {
            Ok(frame) => {
                debug!(context, ?control, "sending control frame");
                self.send_frame(frame).await
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                self.fail_connection(DisconnectCause::WriteFailure {
                    context,
                    error: err.to_string(),
                });
                false
            }
        }
    }

    fn teardown_transport(&mut self) {
        for task in [
            self.open_task.take(),
            self.reader_task.take(),
            self.heartbeat_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.writer = None;
        self.health.on_disconnected();
    }

    /// Abandon the current transport and consult the policy for the next attempt.
    fn fail_connection(&mut self, cause: DisconnectCause) {
        if self.state.is_idle() {
            debug!(cause = %cause, state = %self.state, "ignoring transport failure while idle");
            return;
        }

        self.teardown_transport();
        self.generation = self.generation.wrapping_add(1);
        self.attempt = self.attempt.saturating_add(1);
        self.health.record_error(cause.kind(), &cause.to_string());

        let delay = self.policy.next_delay(self.attempt);
        self.log_reconnect_plan(&cause, delay);
        match delay {
            Some(delay) => {
                self.health.increment_reconnect();
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_retry(delay);
            }
            None => self.set_state(ConnectionState::Failed),
        }
    }

    fn schedule_retry(&mut self, delay: Duration) {
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        let generation = self.generation;
        let actor_ref = self.actor_ref.clone();
        self.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = actor_ref.tell(RetryConnect { generation }).send().await;
        }));
    }

    fn log_reconnect_plan(&self, cause: &DisconnectCause, delay: Option<Duration>) {
        let stats = self.health.snapshot(
            self.state,
            self.registry.topic_count(),
            self.registry.len(),
        );
        let delay_ms = delay.map(|d| d.as_millis().min(u64::MAX as u128) as u64);
        let last_frame_age_ms = stats.last_frame_age.as_millis().min(u64::MAX as u128) as u64;
        let note = if delay.is_some() {
            "scheduled"
        } else {
            "exhausted"
        };

        warn!(
            endpoint = %self.endpoint_label(),
            cause = cause.kind(),
            reason = %cause,
            note,
            attempt = self.attempt,
            delay_ms,
            last_frame_age_ms,
            frames = stats.frames_received,
            topics = stats.topics,
            "metrics stream reconnect plan"
        );
    }
}
