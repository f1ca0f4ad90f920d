use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sonic_rs::{JsonValueTrait, Value};

use super::types::{StreamError, StreamResult};

/// Logical channel name multiplexed over the shared connection.
///
/// Topics are opaque: routing is by exact string match only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Per-scenario aggregate statistics stream.
    pub fn scenario_metrics(scenario_id: &str) -> Self {
        Self(format!("metrics/{scenario_id}"))
    }

    /// Fleet-wide worker status stream.
    pub fn worker_status() -> Self {
        Self::new("workers/status")
    }

    pub fn alerts() -> Self {
        Self::new("alerts")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One decoded observation delivered to subscribers.
#[derive(Clone, Debug)]
pub struct Sample {
    topic: Topic,
    timestamp_ms: i64,
    fields: Value,
}

impl Sample {
    pub fn new(topic: Topic, timestamp_ms: i64, fields: Value) -> Self {
        Self {
            topic,
            timestamp_ms,
            fields,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Unix epoch milliseconds, from the payload when it carries one.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn fields(&self) -> &Value {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|value| value.as_f64())
    }

    /// Decode the payload into one of the typed topic models.
    pub fn decode<T>(&self) -> StreamResult<T>
    where
        T: DeserializeOwned,
    {
        let raw = sonic_rs::to_vec(&self.fields)
            .map_err(|err| StreamError::Decode(format!("re-encode {}: {err}", self.topic)))?;
        sonic_rs::from_slice(&raw)
            .map_err(|err| StreamError::Decode(format!("payload on {}: {err}", self.topic)))
    }
}

/// Aggregate statistics published on `metrics/{scenario_id}`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScenarioStats {
    pub scenario_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// HTTP status code (as sent, a string key) to response count.
    pub status_code_distribution: BTreeMap<String, u64>,
    pub current_rps: f64,
}

impl ScenarioStats {
    /// Fields charted by the latency and throughput views.
    pub const CHART_FIELDS: [&'static str; 4] =
        ["p50LatencyMs", "p95LatencyMs", "p99LatencyMs", "currentRps"];
}

/// Snapshot published on `workers/status`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerStatusSnapshot {
    pub active_workers: u32,
    pub task_queue_size: u64,
    pub timestamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Critical,
    Error,
    Warning,
    Info,
}

/// Alert raised by the backend, published on `alerts`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotice {
    pub id: String,
    pub severity: AlertSeverity,
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub created_at: Option<String>,
}
