//! Market Data Flow Binary
//!
//! Starts the multi-source market data pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-flow
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `DATA_FLOW_FEED_URL`: Upstream stream WebSocket URL
//!
//! ## Optional
//! - `DATA_FLOW_HEALTH_PORT`: Health check HTTP port (default: 8084)
//! - `DATA_FLOW_CACHE_MAX_ENTRIES`: Cache capacity (default: 500)
//! - `DATA_FLOW_CACHE_TTL_SECS`: Default cache TTL (default: 300)
//! - `DATA_FLOW_MIN_SOURCE_COUNT`: Aggregation minimum sources (default: 1)
//! - `DATA_FLOW_FETCH_TIMEOUT_SECS`: Per-source fetch deadline (default: 5)
//! - `DATA_FLOW_MAX_PRICE_CHANGE_PERCENT`: Quality gate threshold (default: 20)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: cream-market-data-flow)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use market_data_flow::infrastructure::feed::ws::{WsTransport, WsTransportConfig};
use market_data_flow::infrastructure::telemetry;
use market_data_flow::{
    AggregatorConfig, ConnectionTracker, EventBus, FeedLatencyMonitor, FlowCache, FlowConfig,
    FlowOrchestrator, HealthServer, HealthServerState, OrchestratorConfig, PipelineComponents,
    SnapshotValidator, SourceAggregator, Transport, TransportEvent, ValidatorConfig, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Transport event channel depth.
const TRANSPORT_EVENT_CAPACITY: usize = 1_024;

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Data Flow");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = FlowConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Explicitly constructed pipeline components, injected at composition
    // time - no process-wide singletons.
    let cache = Arc::new(FlowCache::new((&config.cache).into()));
    let validator = Arc::new(SnapshotValidator::new(ValidatorConfig::from(
        &config.validator,
    )));
    let tracker = Arc::new(ConnectionTracker::new(config.tracker_config()));
    let latency = Arc::new(FeedLatencyMonitor::new(config.latency_config()));
    let bus = Arc::new(EventBus::with_defaults());
    let aggregator = Arc::new(SourceAggregator::new(
        AggregatorConfig::from(&config.aggregator),
        Arc::clone(&validator),
    ));

    // Transport and orchestrator
    let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(TRANSPORT_EVENT_CAPACITY);
    let transport = Arc::new(WsTransport::new(
        WsTransportConfig {
            url: config.feed.url.clone(),
        },
        event_tx,
        shutdown_token.child_token(),
    ));

    let orchestrator = Arc::new(FlowOrchestrator::new(
        OrchestratorConfig::from(&config.orchestrator),
        PipelineComponents {
            cache: Arc::clone(&cache),
            validator: Arc::clone(&validator),
            tracker: Arc::clone(&tracker),
            latency: Arc::clone(&latency),
            bus: Arc::clone(&bus),
        },
        Arc::clone(&transport) as Arc<dyn Transport>,
        shutdown_token.child_token(),
    ));

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&orchestrator),
        Arc::clone(&cache),
        Arc::clone(&aggregator),
        Arc::clone(&tracker),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    // Spawn the orchestrator pipeline
    let orchestrator_clone = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        orchestrator_clone.run(event_rx).await;
    });

    // Spawn the periodic cache cleanup sweep
    tokio::spawn(Arc::clone(&cache).run_cleanup(
        config.cache.cleanup_interval,
        shutdown_token.child_token(),
    ));

    // Spawn the feed transport
    let transport_clone = Arc::clone(&transport);
    tokio::spawn(async move {
        if let Err(e) = transport_clone.run().await {
            tracing::error!(error = %e, "Feed transport error");
        }
    });

    // Spawn health server
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Market data flow ready");

    await_shutdown(shutdown_token).await;

    orchestrator.destroy();

    tracing::info!("Market data flow stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &FlowConfig) {
    tracing::info!(
        feed_url = %config.feed.url,
        health_port = config.server.health_port,
        cache_entries = config.cache.max_entries.get(),
        min_sources = config.aggregator.min_source_count,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
