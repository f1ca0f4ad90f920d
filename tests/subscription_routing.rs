use std::time::Duration;

use loadtest_stream::core::{
    ControlFrame, Sample, ScenarioStats, SeriesPoint, Topic, WindowKey, series_feeder,
};
use loadtest_stream::testing::{MockConnection, MockServer, MockTransport};
use loadtest_stream::{
    AlertSeverity, CallbackResult, ConnectionState, FixedDelay, StreamClient, StreamConfig,
};
use tokio::sync::mpsc;

type MockClient = StreamClient<MockTransport, FixedDelay>;

fn spawn_client(transport: MockTransport) -> MockClient {
    StreamClient::spawn(StreamConfig::default(), transport, FixedDelay::default())
        .expect("valid config")
}

async fn wait_for_state(client: &MockClient, target: ConnectionState) {
    let mut rx = client.watch_state();
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|state| *state == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target}"))
        .expect("state channel open");
}

async fn connected_client() -> (MockClient, MockServer, MockConnection) {
    let (transport, mut server) = MockTransport::channel_pair();
    let client = spawn_client(transport);
    client.connect("ws://mock/ws", |_| {}).await;
    let conn = server.accept().await.expect("connection accepted");
    wait_for_state(&client, ConnectionState::Connected).await;
    (client, server, conn)
}

fn tagged(
    tx: &mpsc::UnboundedSender<(&'static str, i64)>,
    name: &'static str,
) -> impl FnMut(&Sample) -> CallbackResult + Send + 'static {
    let tx = tx.clone();
    move |sample: &Sample| {
        let _ = tx.send((name, sample.timestamp_ms()));
        Ok(())
    }
}

fn subscribe_frame(topic: Topic) -> Option<ControlFrame> {
    Some(ControlFrame::Subscribe { topic })
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_callback_stops_while_siblings_continue() {
    let (client, _server, mut conn) = connected_client().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = client.subscribe(Topic::alerts(), tagged(&tx, "first")).await;
    let _second = client.subscribe(Topic::alerts(), tagged(&tx, "second")).await;
    assert_eq!(conn.recv_control().await, subscribe_frame(Topic::alerts()));

    conn.send_envelope("alerts", r#"{"timestamp":1}"#).unwrap();
    assert_eq!(rx.recv().await, Some(("first", 1)));
    assert_eq!(rx.recv().await, Some(("second", 1)));

    client.unsubscribe(first).await;
    conn.send_envelope("alerts", r#"{"timestamp":2}"#).unwrap();
    assert_eq!(rx.recv().await, Some(("second", 2)));

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.subscriptions, 1);
    assert_eq!(stats.topics, 1);
    assert!(rx.try_recv().is_err());
    // The topic still has a subscriber, so no unsubscribe frame went out.
    assert_eq!(
        conn.recv_control_timeout(Duration::from_millis(100)).await,
        None
    );
}

#[tokio::test(start_paused = true)]
async fn control_frames_only_for_first_and_last_subscriber() {
    let (client, _server, mut conn) = connected_client().await;
    let topic = Topic::scenario_metrics("s-1");

    let a = client.subscribe(topic.clone(), |_: &Sample| Ok(())).await;
    let b = client.subscribe(topic.clone(), |_: &Sample| Ok(())).await;
    client.unsubscribe(a).await;
    client.unsubscribe(b).await;
    client.unsubscribe(b).await;
    client.current_state().await.unwrap();

    assert_eq!(conn.recv_control().await, subscribe_frame(topic.clone()));
    assert_eq!(
        conn.recv_control().await,
        Some(ControlFrame::Unsubscribe { topic })
    );
    assert_eq!(
        conn.recv_control_timeout(Duration::from_millis(100)).await,
        None
    );
    assert_eq!(client.stats().await.unwrap().subscriptions, 0);
}

#[tokio::test(start_paused = true)]
async fn subscriptions_made_while_disconnected_are_sent_on_open() {
    let (transport, mut server) = MockTransport::channel_pair();
    let client = spawn_client(transport);

    client.subscribe(Topic::worker_status(), |_: &Sample| Ok(())).await;
    client.subscribe(Topic::alerts(), |_: &Sample| Ok(())).await;
    client.subscribe(Topic::worker_status(), |_: &Sample| Ok(())).await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(server.attempt_count(), 0);

    client.connect("ws://mock/ws", |_| {}).await;
    let mut conn = server.accept().await.expect("connection accepted");
    assert_eq!(conn.recv_control().await, subscribe_frame(Topic::worker_status()));
    assert_eq!(conn.recv_control().await, subscribe_frame(Topic::alerts()));
    assert_eq!(
        conn.recv_control_timeout(Duration::from_millis(100)).await,
        None
    );
    assert_eq!(server.last_url().as_deref(), Some("ws://mock/ws"));
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_side_effects() {
    let (client, _server, mut conn) = connected_client().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.subscribe(Topic::alerts(), tagged(&tx, "alerts")).await;
    conn.recv_control().await;

    conn.send_text("not json at all").unwrap();
    conn.send_text(r#"{"body":"{}"}"#).unwrap();
    conn.send_envelope("alerts", "{truncated").unwrap();
    conn.send_envelope("alerts", r#"{"timestamp":7}"#).unwrap();

    assert_eq!(rx.recv().await, Some(("alerts", 7)));
    let stats = client.stats().await.unwrap();
    assert_eq!(stats.decode_failures, 3);
    assert_eq!(stats.samples_dispatched, 1);
    assert_eq!(stats.reconnects, 0);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn failing_and_panicking_callbacks_are_isolated() {
    let (client, _server, mut conn) = connected_client().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    client
        .subscribe(Topic::alerts(), |_: &Sample| Err("chart detached".into()))
        .await;
    client
        .subscribe(Topic::alerts(), |_: &Sample| -> CallbackResult {
            panic!("view torn down mid-render")
        })
        .await;
    client.subscribe(Topic::alerts(), tagged(&tx, "healthy")).await;
    conn.recv_control().await;

    conn.send_envelope("alerts", r#"{"timestamp":1}"#).unwrap();
    conn.send_envelope("alerts", r#"{"timestamp":2}"#).unwrap();
    assert_eq!(rx.recv().await, Some(("healthy", 1)));
    assert_eq!(rx.recv().await, Some(("healthy", 2)));

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.callback_failures, 4);
    assert_eq!(stats.samples_dispatched, 2);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn frames_for_unsubscribed_topics_are_counted_not_delivered() {
    let (client, _server, mut conn) = connected_client().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe(Topic::scenario_metrics("s-1"), tagged(&tx, "s-1"))
        .await;
    conn.recv_control().await;

    conn.send_envelope("metrics/s-10", r#"{"timestamp":1}"#).unwrap();
    conn.send_envelope("metrics/s-1", r#"{"timestamp":2}"#).unwrap();
    assert_eq!(rx.recv().await, Some(("s-1", 2)));
    assert_eq!(client.stats().await.unwrap().unrouted_frames, 1);
}

#[tokio::test(start_paused = true)]
async fn typed_scenario_stats_feed_chart_windows() {
    let (client, _server, mut conn) = connected_client().await;
    let topic = Topic::scenario_metrics("s-1");
    let charts = client.window_handle::<SeriesPoint>();

    client
        .subscribe(
            topic.clone(),
            series_feeder(charts.clone(), ScenarioStats::CHART_FIELDS),
        )
        .await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe_scenario_metrics("s-1", move |stats| {
            let _ = tx.send(stats.total_requests);
        })
        .await;
    assert_eq!(conn.recv_control().await, subscribe_frame(topic.clone()));

    for i in 1..=25 {
        conn.send_envelope(
            "metrics/s-1",
            &format!(
                r#"{{"scenarioId":"s-1","totalRequests":{i},"p50LatencyMs":{i},"timestamp":{i}}}"#
            ),
        )
        .unwrap();
    }
    for i in 1..=25u64 {
        assert_eq!(rx.recv().await, Some(i));
    }

    let p50 = charts.snapshot(&WindowKey::new(topic.clone(), "p50LatencyMs"));
    assert_eq!(p50.len(), 20);
    assert_eq!(p50.first().map(|p| p.timestamp_ms), Some(6));
    assert_eq!(p50.last().map(|p| p.value), Some(25.0));
    assert!(
        charts
            .snapshot(&WindowKey::new(topic, "p99LatencyMs"))
            .is_empty()
    );
}

#[tokio::test(start_paused = true)]
async fn typed_alert_decode_failures_count_as_callback_failures() {
    let (client, _server, mut conn) = connected_client().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe_alerts(move |alert| {
            let _ = tx.send((alert.id, alert.severity));
        })
        .await;
    conn.recv_control().await;

    conn.send_envelope("alerts", r#"{"id":"a-1","severity":"SHOUTING","title":"?"}"#)
        .unwrap();
    conn.send_envelope(
        "alerts",
        r#"{"id":"a-2","severity":"WARNING","title":"p99 above SLO","message":"p99=812ms"}"#,
    )
    .unwrap();

    assert_eq!(
        rx.recv().await,
        Some(("a-2".to_string(), AlertSeverity::Warning))
    );
    assert_eq!(client.stats().await.unwrap().callback_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn callbacks_may_own_unsynchronized_state() {
    let (client, _server, mut conn) = connected_client().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    // `Cell` is `Send` but not `Sync`; the manager is the only caller.
    let seen = std::cell::Cell::new(0u32);
    client
        .subscribe_worker_status(move |status| {
            seen.set(seen.get() + 1);
            let _ = tx.send((seen.get(), status.active_workers));
        })
        .await;
    conn.recv_control().await;

    for workers in [3, 5] {
        conn.send_envelope(
            "workers/status",
            &format!(r#"{{"activeWorkers":{workers},"taskQueueSize":0}}"#),
        )
        .unwrap();
    }
    assert_eq!(rx.recv().await, Some((1, 3)));
    assert_eq!(rx.recv().await, Some((2, 5)));
}
