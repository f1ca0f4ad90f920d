//! Public facade over the connection manager actor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kameo::prelude::{Actor, ActorRef};
use tokio::sync::watch;
use tracing::warn;

use crate::config::StreamConfig;
use crate::core::{
    AlertNotice, CallbackResult, ConnectionState, ConnectionStats, FixedDelay, ReconnectPolicy,
    Sample, ScenarioStats, StreamError, StreamResult, Topic, WindowHandle, WorkerStatusSnapshot,
};
use crate::stream::{
    Connect, ConnectionManager, ConnectionManagerArgs, Disconnect, GetConnectionState,
    GetConnectionStats, StateCallback, Subscribe, SubscriptionHandle, Unsubscribe,
};
use crate::transport::{TungsteniteTransport, WsTransport};

/// Handle to one metrics stream connection and its subscriptions.
///
/// Cloning is cheap; all clones drive the same connection manager. There is no process-wide
/// instance: construct one and pass it to the views that need it.
pub struct StreamClient<T = TungsteniteTransport, P = FixedDelay>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    manager: ActorRef<ConnectionManager<T, P>>,
    state_rx: watch::Receiver<ConnectionState>,
    next_handle: Arc<AtomicU64>,
    config: Arc<StreamConfig>,
}

impl<T, P> Clone for StreamClient<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            state_rx: self.state_rx.clone(),
            next_handle: Arc::clone(&self.next_handle),
            config: Arc::clone(&self.config),
        }
    }
}

impl StreamClient {
    /// Client over tokio-tungstenite with the fixed 5 s reconnect policy.
    pub fn new(config: StreamConfig) -> StreamResult<Self> {
        Self::spawn(config, TungsteniteTransport::default(), FixedDelay::default())
    }
}

impl<T, P> StreamClient<T, P>
where
    T: WsTransport,
    P: ReconnectPolicy,
{
    /// Spawn a connection manager with an explicit transport and reconnect policy.
    pub fn spawn(config: StreamConfig, transport: T, policy: P) -> StreamResult<Self> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let manager = ConnectionManager::spawn(ConnectionManagerArgs {
            config: config.clone(),
            transport,
            policy,
            state_tx,
        });
        Ok(Self {
            manager,
            state_rx,
            next_handle: Arc::new(AtomicU64::new(1)),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Open the connection. No-op while already connected or connecting.
    pub async fn connect<F>(&self, endpoint: impl Into<String>, on_state_change: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let callback: StateCallback = Arc::new(on_state_change);
        self.send_connect(endpoint.into(), Some(callback)).await;
    }

    /// Open the connection to the configured endpoint, keeping any existing state observer.
    pub async fn connect_configured(&self) {
        self.send_connect(self.config.endpoint.clone(), None).await;
    }

    async fn send_connect(&self, endpoint: String, on_state_change: Option<StateCallback>) {
        if let Err(err) = self
            .manager
            .tell(Connect {
                endpoint,
                on_state_change,
            })
            .send()
            .await
        {
            warn!(error = %err, "connection manager unavailable; connect dropped");
        }
    }

    /// Close the connection and cancel any pending retry. Subscriptions are kept.
    pub async fn disconnect(&self) {
        if let Err(err) = self.manager.tell(Disconnect).send().await {
            warn!(error = %err, "connection manager unavailable; disconnect dropped");
        }
    }

    /// Register `on_sample` for `topic`. It runs on the manager for every sample, in
    /// registration order with the topic's other callbacks.
    pub async fn subscribe<F>(&self, topic: impl Into<Topic>, on_sample: F) -> SubscriptionHandle
    where
        F: FnMut(&Sample) -> CallbackResult + Send + 'static,
    {
        let handle = SubscriptionHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let topic = topic.into();
        if let Err(err) = self
            .manager
            .tell(Subscribe {
                handle,
                topic: topic.clone(),
                callback: Box::new(on_sample),
            })
            .send()
            .await
        {
            warn!(%handle, %topic, error = %err, "connection manager unavailable; subscription dropped");
        }
        handle
    }

    /// Remove a subscription. Unknown handles are ignored.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Err(err) = self.manager.tell(Unsubscribe { handle }).send().await {
            warn!(%handle, error = %err, "connection manager unavailable; unsubscribe dropped");
        }
    }

    /// Typed subscription to a scenario's aggregate statistics.
    pub async fn subscribe_scenario_metrics<F>(
        &self,
        scenario_id: &str,
        mut on_stats: F,
    ) -> SubscriptionHandle
    where
        F: FnMut(ScenarioStats) + Send + 'static,
    {
        self.subscribe(Topic::scenario_metrics(scenario_id), move |sample: &Sample| {
            on_stats(sample.decode()?);
            Ok(())
        })
        .await
    }

    pub async fn subscribe_worker_status<F>(&self, mut on_status: F) -> SubscriptionHandle
    where
        F: FnMut(WorkerStatusSnapshot) + Send + 'static,
    {
        self.subscribe(Topic::worker_status(), move |sample: &Sample| {
            on_status(sample.decode()?);
            Ok(())
        })
        .await
    }

    pub async fn subscribe_alerts<F>(&self, mut on_alert: F) -> SubscriptionHandle
    where
        F: FnMut(AlertNotice) + Send + 'static,
    {
        self.subscribe(Topic::alerts(), move |sample: &Sample| {
            on_alert(sample.decode()?);
            Ok(())
        })
        .await
    }

    /// Last published state; never blocks.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// State as seen by the manager after it has processed every earlier request.
    pub async fn current_state(&self) -> StreamResult<ConnectionState> {
        self.manager
            .ask(GetConnectionState)
            .await
            .map_err(|err| StreamError::ActorError(err.to_string()))
    }

    pub async fn stats(&self) -> StreamResult<ConnectionStats> {
        self.manager
            .ask(GetConnectionStats)
            .await
            .map_err(|err| StreamError::ActorError(err.to_string()))
    }

    /// Window set sized with the configured default capacity.
    pub fn window_handle<U>(&self) -> WindowHandle<U> {
        WindowHandle::new(self.config.window_capacity)
    }

    /// Stop the manager; the transport is closed and pending timers are cancelled.
    pub async fn shutdown(self) {
        let _ = self.manager.stop_gracefully().await;
        self.manager.wait_for_shutdown().await;
    }
}
