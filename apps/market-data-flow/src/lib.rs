#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Data Flow - Multi-Source Ingestion Pipeline
//!
//! Ingests streaming market-price updates from redundant upstream sources,
//! validates and sanitizes them, detects anomalies and cross-source
//! disagreement, caches results under bounded memory, and republishes a
//! clean event stream plus health/quality metrics.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core market-data types and synchronous validation
//!   - `snapshot`: Canonical snapshot model
//!   - `validation`: Quality gate, anomaly and cross-source checks
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Interfaces for the stream transport and source fetchers
//!   - `services`: Multi-source aggregation, flow orchestration
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `feed`: Wire types, JSON codec, WebSocket transport
//!   - `cache`: Bounded TTL + LRU snapshot cache
//!   - `connection`: Connection quality tracking
//!   - `events`: Broadcast event bus for downstream consumers
//!   - `config`: Configuration and dependency injection
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Upstream WS ──► Orchestrator ──► Validator ──► Cache ──┐
//!                     │                                  ├──► Event Bus ──► Consumer 1
//!                     └──► Tracker / Latency / Alerts ───┘            └──► Consumer N
//!
//! Source A ──┐
//! Source B ──┼──► Aggregator (pull-based, priority failover)
//! Source C ──┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market-data types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::snapshot::{Ohlcv, Snapshot, SourceId, Symbol};
pub use domain::validation::{
    AnomalyDetection, CrossSourceReport, QualityReport, SnapshotValidator, ValidatorConfig,
};

// Ports
pub use application::ports::{
    ControlMessage, FetchError, SourceFetcher, SymbolList, Transport, TransportError,
    TransportEvent,
};

// Services
pub use application::services::aggregator::{
    AggregationResult, AggregatorConfig, AggregatorStats, DataSource, FetchOutcome, HealthPolicy,
    SourceAggregator, SourceError, additive_policy,
};
pub use application::services::orchestrator::{
    ConnectionState, FlowOrchestrator, OrchestratorConfig, PipelineComponents, PipelineCounters,
    data_quality_score,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, FlowConfig};

// Cache (for integration tests and composition)
pub use infrastructure::cache::{CacheConfig, CacheStats, FlowCache, PrefetchStrategy};

// Connection tracking
pub use infrastructure::connection::{
    ConnectionMetrics, ConnectionQuality, ConnectionTracker, FeedLatencyMonitor, LatencyConfig,
    LatencyLevel, TrackerConfig,
};

// Event bus
pub use infrastructure::events::{
    Alert, AlertKind, AlertSeverity, ConnectionEvent, DataEvent, EventBus, EventBusConfig,
    EventBusStats, PipelineMetrics, SharedEventBus,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
