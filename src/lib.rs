//! Real-time metrics streaming client for the load-testing console.
//!
//! One long-lived websocket carries several topic subscriptions (per-scenario metrics, worker
//! status, alerts). A kameo actor owns the connection, keeps it alive with heartbeats,
//! re-establishes it after failures and replays subscriptions; decoded samples are handed to
//! callbacks that typically feed bounded sliding windows for charts.

pub mod client;
pub mod config;
pub mod core;
pub mod stream;
pub mod testing;
pub mod tls;
pub mod transport;

pub use client::StreamClient;
pub use config::StreamConfig;
pub use core::{
    AlertNotice, AlertSeverity, CallbackError, CallbackResult, ConnectionState, ConnectionStats,
    ErrorRecord, ExponentialBackoff, FixedDelay, Jittered, ReconnectPolicy, Sample, ScenarioStats,
    SeriesPoint, SlidingWindowAggregator, StreamError, StreamResult, Topic, Window, WindowHandle,
    WindowKey, WorkerStatusSnapshot,
};
pub use stream::{StateCallback, SubscriptionHandle};
