//! Pipeline Flow Integration Tests
//!
//! Drives a full orchestrator over an injected transport and verifies the
//! pipeline end to end: parsing, gating, caching, event emission, and
//! teardown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use market_data_flow::{
    AlertKind, AlertSeverity, CacheConfig, ConnectionState, ConnectionTracker, ControlMessage,
    EventBus, FeedLatencyMonitor, FlowCache, FlowOrchestrator, OrchestratorConfig,
    PipelineComponents, SnapshotValidator, Transport, TransportError, TransportEvent,
    data_quality_score,
};

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<ControlMessage>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: ControlMessage) -> Result<(), TransportError> {
        self.sent.lock().push(message);
        Ok(())
    }

    async fn disconnect(&self) {}
}

struct Pipeline {
    orchestrator: Arc<FlowOrchestrator>,
    transport: Arc<RecordingTransport>,
    bus: Arc<EventBus>,
    event_tx: mpsc::Sender<TransportEvent>,
    handle: tokio::task::JoinHandle<()>,
}

fn spawn_pipeline() -> Pipeline {
    let transport = Arc::new(RecordingTransport::default());
    let bus = Arc::new(EventBus::with_defaults());
    let components = PipelineComponents {
        cache: Arc::new(FlowCache::new(CacheConfig::default())),
        validator: Arc::new(SnapshotValidator::with_defaults()),
        tracker: Arc::new(ConnectionTracker::with_defaults()),
        latency: Arc::new(FeedLatencyMonitor::with_defaults()),
        bus: Arc::clone(&bus),
    };
    let orchestrator = Arc::new(FlowOrchestrator::new(
        OrchestratorConfig::default(),
        components,
        Arc::clone(&transport) as Arc<dyn Transport>,
        CancellationToken::new(),
    ));

    let (event_tx, event_rx) = mpsc::channel(64);
    let handle = tokio::spawn(Arc::clone(&orchestrator).run(event_rx));

    Pipeline {
        orchestrator,
        transport,
        bus,
        event_tx,
        handle,
    }
}

fn market_message(symbol: &str, close: f64) -> String {
    serde_json::json!({
        "type": "market_data",
        "symbol": symbol,
        "timestamp": Utc::now().timestamp_millis(),
        "ohlcv": {
            "date": Utc::now().to_rfc3339(),
            "open": close,
            "high": close + 0.5,
            "low": close - 0.5,
            "close": close,
            "volume": 25_000,
        },
    })
    .to_string()
}

fn jump_message(symbol: &str) -> String {
    serde_json::json!({
        "type": "market_data",
        "symbol": symbol,
        "timestamp": Utc::now().timestamp_millis(),
        "ohlcv": {
            "date": Utc::now().to_rfc3339(),
            "open": 125.0, "high": 126.0, "low": 124.0, "close": 125.0,
            "volume": 25_000,
        },
        "previousClose": 100.0,
    })
    .to_string()
}

#[tokio::test]
async fn valid_message_reaches_consumers_and_cache() {
    let pipeline = spawn_pipeline();
    let mut data_rx = pipeline.bus.data_rx();

    pipeline
        .event_tx
        .send(TransportEvent::Connected)
        .await
        .unwrap();
    pipeline
        .event_tx
        .send(TransportEvent::Message(market_message("AAPL", 187.5)))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(1), data_rx.recv())
        .await
        .expect("data event within deadline")
        .unwrap();
    assert_eq!(event.snapshot.symbol, "AAPL");

    assert_eq!(pipeline.orchestrator.state(), ConnectionState::Connected);
    let cached = pipeline.orchestrator.cached_snapshot("AAPL");
    assert!(cached.is_some(), "validated snapshot must be cached");

    pipeline.orchestrator.destroy();
    let _ = timeout(Duration::from_secs(1), pipeline.handle).await;
}

#[tokio::test]
async fn rejected_snapshot_never_appears_downstream() {
    let pipeline = spawn_pipeline();
    let mut data_rx = pipeline.bus.data_rx();
    let mut alerts_rx = pipeline.bus.alerts_rx();

    pipeline
        .event_tx
        .send(TransportEvent::Connected)
        .await
        .unwrap();
    pipeline
        .event_tx
        .send(TransportEvent::Message(jump_message("TSLA")))
        .await
        .unwrap();

    // The quality alert arrives; skip the connection-established alert.
    let alert = loop {
        let alert = timeout(Duration::from_secs(1), alerts_rx.recv())
            .await
            .expect("alert within deadline")
            .unwrap();
        if alert.kind == AlertKind::Quality {
            break alert;
        }
    };
    assert_eq!(alert.severity, AlertSeverity::Error);

    assert!(pipeline.orchestrator.cached_snapshot("TSLA").is_none());
    assert!(data_rx.try_recv().is_err(), "no data event may be emitted");
    assert_eq!(pipeline.orchestrator.counters().invalid, 1);

    pipeline.orchestrator.destroy();
    let _ = timeout(Duration::from_secs(1), pipeline.handle).await;
}

#[tokio::test]
async fn unparseable_and_passthrough_messages_are_handled() {
    let pipeline = spawn_pipeline();
    let mut passthrough_rx = pipeline.bus.passthrough_rx();

    pipeline
        .event_tx
        .send(TransportEvent::Connected)
        .await
        .unwrap();
    pipeline
        .event_tx
        .send(TransportEvent::Message("garbage".to_string()))
        .await
        .unwrap();
    pipeline
        .event_tx
        .send(TransportEvent::Message(
            r#"{"type": "status", "status": "market_open"}"#.to_string(),
        ))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(1), passthrough_rx.recv())
        .await
        .expect("passthrough within deadline")
        .unwrap();
    assert_eq!(event.payload["status"], "market_open");

    let counters = pipeline.orchestrator.counters();
    assert_eq!(counters.parse_failures, 1);
    assert_eq!(counters.passthrough, 1);

    pipeline.orchestrator.destroy();
    let _ = timeout(Duration::from_secs(1), pipeline.handle).await;
}

#[tokio::test]
async fn subscribe_round_trips_through_transport() {
    let pipeline = spawn_pipeline();

    pipeline
        .orchestrator
        .subscribe(vec!["AAPL".to_string(), "MSFT".to_string()])
        .await;

    let sent = pipeline.transport.sent.lock();
    assert_eq!(sent.len(), 1);
    let ControlMessage::Subscribe { data } = &sent[0] else {
        panic!("expected subscribe message");
    };
    assert_eq!(data.symbols, vec!["AAPL".to_string(), "MSFT".to_string()]);
    drop(sent);

    pipeline.orchestrator.destroy();
    let _ = timeout(Duration::from_secs(1), pipeline.handle).await;
}

#[tokio::test]
async fn lifetime_counters_drive_the_quality_score() {
    let pipeline = spawn_pipeline();

    pipeline
        .event_tx
        .send(TransportEvent::Connected)
        .await
        .unwrap();
    for _ in 0..8 {
        pipeline
            .event_tx
            .send(TransportEvent::Message(market_message("AAPL", 100.0)))
            .await
            .unwrap();
    }
    for _ in 0..2 {
        pipeline
            .event_tx
            .send(TransportEvent::Message(jump_message("AAPL")))
            .await
            .unwrap();
    }

    // Wait until the single pipeline task has drained all ten messages.
    timeout(Duration::from_secs(2), async {
        loop {
            let counters = pipeline.orchestrator.counters();
            if counters.valid + counters.invalid == 10 {
                break counters;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pipeline should process all messages");

    let counters = pipeline.orchestrator.counters();
    assert_eq!(counters.valid, 8);
    assert_eq!(counters.invalid, 2);
    assert_eq!(counters.anomalies, 0);

    // 8/10 valid, no anomalies: 0.8 * 80 + 1.0 * 20 = 84.
    let score = data_quality_score(counters.valid, counters.invalid, counters.anomalies);
    assert!((score - 84.0).abs() < 1e-9);

    pipeline.orchestrator.destroy();
    let _ = timeout(Duration::from_secs(1), pipeline.handle).await;
}

#[tokio::test]
async fn destroyed_pipeline_ignores_late_traffic() {
    let pipeline = spawn_pipeline();

    pipeline
        .event_tx
        .send(TransportEvent::Connected)
        .await
        .unwrap();
    pipeline.orchestrator.destroy();
    let _ = timeout(Duration::from_secs(1), pipeline.handle).await;

    // The run loop is gone; sends fail quietly and nothing panics.
    let _ = pipeline
        .event_tx
        .send(TransportEvent::Message(market_message("AAPL", 100.0)))
        .await;
    assert_eq!(pipeline.orchestrator.state(), ConnectionState::Destroyed);
    assert_eq!(pipeline.orchestrator.counters().received, 0);
}
