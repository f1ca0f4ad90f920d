use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use loadtest_stream::core::{ScenarioStats, SeriesPoint, Topic, WindowKey, series_feeder};
use loadtest_stream::{StreamClient, StreamConfig};

fn usage() -> &'static str {
    "live_console\n\
  Streams one scenario's metrics plus worker status and alerts, logging the chart windows.\n\
\n\
USAGE:\n\
  cargo run --example live_console -- [--scenario <ID>] [--secs <N>]\n\
\n\
ENVIRONMENT:\n\
  LOADTEST_STREAM_URL            websocket endpoint (default ws://localhost:8080/ws)\n\
  LOADTEST_STREAM_HEARTBEAT_MS   heartbeat interval\n\
  LOADTEST_STREAM_WINDOW         points kept per chart series (default 20)\n\
  RUST_LOG                       log filter (default info)\n\
"
}

fn parse_args() -> (String, u64) {
    let mut scenario = "demo".to_string();
    let mut secs: u64 = 60;

    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        match (a.as_str(), it.next()) {
            ("--scenario", Some(v)) => scenario = v,
            ("--secs", Some(v)) => {
                secs = v.parse().unwrap_or_else(|_| {
                    eprintln!("{usage}", usage = usage());
                    std::process::exit(2);
                })
            }
            _ => {
                eprintln!("{usage}", usage = usage());
                std::process::exit(2);
            }
        }
    }
    (scenario, secs)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let (scenario, secs) = parse_args();
    let config = StreamConfig::from_env()?;
    let client = StreamClient::new(config)?;
    let topic = Topic::scenario_metrics(&scenario);

    let charts = client.window_handle::<SeriesPoint>();
    client
        .subscribe(
            topic.clone(),
            series_feeder(charts.clone(), ScenarioStats::CHART_FIELDS),
        )
        .await;
    client
        .subscribe_worker_status(|status| {
            info!(
                active = status.active_workers,
                queued = status.task_queue_size,
                "workers"
            );
        })
        .await;
    client
        .subscribe_alerts(|alert| {
            info!(id = %alert.id, severity = ?alert.severity, title = %alert.title, "alert");
        })
        .await;

    let endpoint = client.config().endpoint.clone();
    client
        .connect(endpoint, |state| info!(%state, "connection state"))
        .await;

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        for field in ScenarioStats::CHART_FIELDS {
            let points = charts.snapshot(&WindowKey::new(topic.clone(), field));
            info!(
                series = field,
                points = points.len(),
                latest = ?points.last().map(|p| p.value),
                "chart window"
            );
        }
        let stats = client.stats().await?;
        info!(
            state = %stats.state,
            frames = stats.frames_received,
            decode_failures = stats.decode_failures,
            reconnects = stats.reconnects,
            rtt_p50_us = stats.heartbeat_rtt_p50_us,
            "stream stats"
        );
    }

    client.disconnect().await;
    client.shutdown().await;
    Ok(())
}
