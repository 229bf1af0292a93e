//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, pipeline status reporting, and
//! Prometheus metrics. Used by container orchestrators, load balancers, and
//! monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (checks the stream)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::aggregator::{AggregatorStats, SourceAggregator};
use crate::application::services::orchestrator::{
    ConnectionState, FlowOrchestrator, PipelineCounters, data_quality_score,
};
use crate::domain::snapshot::Snapshot;
use crate::infrastructure::cache::FlowCache;
use crate::infrastructure::connection::{ConnectionMetrics, ConnectionTracker};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Stream connection status.
    pub connection: ConnectionStatus,
    /// Pipeline counters and quality score.
    pub pipeline: PipelineStatus,
    /// Cache statistics.
    pub cache: CacheStatus,
    /// Source registry statistics.
    pub sources: AggregatorStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some systems degraded but functional.
    Degraded,
    /// Critical systems unavailable.
    Unhealthy,
}

/// Stream connection status.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Orchestrator connection state.
    pub state: ConnectionState,
    /// Tracker metrics snapshot.
    pub metrics: ConnectionMetrics,
}

/// Pipeline status.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Lifetime counters.
    pub counters: PipelineCounters,
    /// Composite data quality score in [0, 100].
    pub data_quality_score: f64,
    /// Alerts currently retained.
    pub alerts_retained: usize,
}

/// Cache status.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    /// Entries currently held.
    pub entries: usize,
    /// Reads served from cache.
    pub hits: u64,
    /// Reads that missed.
    pub misses: u64,
    /// Hit rate in [0, 1].
    pub hit_rate: f64,
    /// Entries evicted at capacity.
    pub evictions: u64,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    orchestrator: Arc<FlowOrchestrator>,
    cache: Arc<FlowCache<Snapshot>>,
    aggregator: Arc<SourceAggregator>,
    tracker: Arc<ConnectionTracker>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        orchestrator: Arc<FlowOrchestrator>,
        cache: Arc<FlowCache<Snapshot>>,
        aggregator: Arc<SourceAggregator>,
        tracker: Arc<ConnectionTracker>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            orchestrator,
            cache,
            aggregator,
            tracker,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.orchestrator.state() == ConnectionState::Connected {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let connection_state = state.orchestrator.state();
    let tracker_metrics = state.tracker.snapshot();
    let counters = state.orchestrator.counters();
    let cache_stats = state.cache.stats();

    HealthResponse {
        status: determine_health_status(connection_state, &tracker_metrics),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        connection: ConnectionStatus {
            state: connection_state,
            metrics: tracker_metrics,
        },
        pipeline: PipelineStatus {
            counters,
            data_quality_score: data_quality_score(
                counters.valid,
                counters.invalid,
                counters.anomalies,
            ),
            alerts_retained: state.orchestrator.alerts().len(),
        },
        cache: CacheStatus {
            entries: state.cache.len(),
            hits: cache_stats.hits,
            misses: cache_stats.misses,
            hit_rate: cache_stats.hit_rate(),
            evictions: cache_stats.evictions,
        },
        sources: state.aggregator.stats(),
    }
}

fn determine_health_status(
    state: ConnectionState,
    metrics: &ConnectionMetrics,
) -> HealthStatus {
    use crate::infrastructure::connection::ConnectionQuality;

    match state {
        ConnectionState::Connected => match metrics.quality {
            ConnectionQuality::Poor => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        },
        ConnectionState::Connecting => HealthStatus::Degraded,
        ConnectionState::Disconnected | ConnectionState::Destroyed => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
