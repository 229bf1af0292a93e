//! Pipeline Configuration Settings
//!
//! Configuration types for the flow pipeline, loaded from environment
//! variables. Only construction-time misconfiguration is an error; every
//! optional knob falls back to its default when unset or unparseable.

use std::num::NonZeroUsize;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::application::services::aggregator::AggregatorConfig;
use crate::application::services::orchestrator::OrchestratorConfig;
use crate::domain::validation::ValidatorConfig;
use crate::infrastructure::cache::CacheConfig;
use crate::infrastructure::connection::{LatencyConfig, TrackerConfig};

/// Upstream feed settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Stream endpoint URL.
    pub url: String,
    /// Pending probes older than this count as lost.
    pub probe_timeout: Duration,
    /// Feed latency that raises a warning alert.
    pub latency_warning: Duration,
    /// Feed latency that raises a critical alert.
    pub latency_critical: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: "wss://stream.example.markets/v1/prices".to_string(),
            probe_timeout: Duration::from_secs(10),
            latency_warning: Duration::from_secs(1),
            latency_critical: Duration::from_secs(5),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8084 }
    }
}

/// Snapshot cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Hard bound on cached entries.
    pub max_entries: NonZeroUsize,
    /// Default TTL for cached values.
    pub default_ttl: Duration,
    /// Interval of the periodic expiry sweep.
    pub cleanup_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: NonZeroUsize::new(500).unwrap_or(NonZeroUsize::MIN),
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            max_entries: settings.max_entries,
            default_ttl: settings.default_ttl,
        }
    }
}

/// Quality gate settings.
#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    /// Maximum distance between a record timestamp and now.
    pub max_timestamp_delay: Duration,
    /// Maximum percentage change versus the previous close.
    pub max_price_change_percent: Decimal,
    /// Maximum relative price divergence across sources.
    pub divergence_threshold: f64,
    /// Window within which records are comparable across sources.
    pub freshness_window: Duration,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            max_timestamp_delay: Duration::from_secs(60),
            max_price_change_percent: Decimal::from(20),
            divergence_threshold: 0.05,
            freshness_window: Duration::from_secs(30),
        }
    }
}

impl From<&ValidatorSettings> for ValidatorConfig {
    fn from(settings: &ValidatorSettings) -> Self {
        Self {
            max_timestamp_delay: settings.max_timestamp_delay,
            max_price_change_percent: settings.max_price_change_percent,
            divergence_threshold: settings.divergence_threshold,
            freshness_window: settings.freshness_window,
            ..Self::default()
        }
    }
}

/// Multi-source aggregator settings.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Minimum healthy sources before any fetch is attempted.
    pub min_source_count: usize,
    /// Health score a source must exceed to count as healthy.
    pub health_threshold: f64,
    /// Per-fetch deadline.
    pub fetch_timeout: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            min_source_count: 1,
            health_threshold: 50.0,
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&AggregatorSettings> for AggregatorConfig {
    fn from(settings: &AggregatorSettings) -> Self {
        Self {
            min_source_count: settings.min_source_count,
            health_threshold: settings.health_threshold,
            fetch_timeout: settings.fetch_timeout,
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Ring-buffer capacity of the alert log.
    pub alert_capacity: usize,
    /// Interval of the metrics tick while connected.
    pub metrics_interval: Duration,
    /// TTL for cached stream snapshots.
    pub snapshot_ttl: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            alert_capacity: 100,
            metrics_interval: Duration::from_secs(1),
            snapshot_ttl: Duration::from_secs(60),
        }
    }
}

impl From<&OrchestratorSettings> for OrchestratorConfig {
    fn from(settings: &OrchestratorSettings) -> Self {
        Self {
            alert_capacity: settings.alert_capacity,
            metrics_interval: settings.metrics_interval,
            snapshot_ttl: settings.snapshot_ttl,
            ..Self::default()
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct FlowConfig {
    /// Upstream feed settings.
    pub feed: FeedSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Cache settings.
    pub cache: CacheSettings,
    /// Quality gate settings.
    pub validator: ValidatorSettings,
    /// Aggregator settings.
    pub aggregator: AggregatorSettings,
    /// Orchestrator settings.
    pub orchestrator: OrchestratorSettings,
}

impl FlowConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATA_FLOW_FEED_URL` is missing or empty, or if
    /// `DATA_FLOW_CACHE_MAX_ENTRIES` is explicitly set to zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("DATA_FLOW_FEED_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATA_FLOW_FEED_URL".to_string()))?;
        if url.is_empty() {
            return Err(ConfigError::EmptyValue("DATA_FLOW_FEED_URL".to_string()));
        }

        let feed = FeedSettings {
            url,
            probe_timeout: parse_env_duration_secs(
                "DATA_FLOW_PROBE_TIMEOUT_SECS",
                FeedSettings::default().probe_timeout,
            ),
            latency_warning: parse_env_duration_millis(
                "DATA_FLOW_LATENCY_WARNING_MS",
                FeedSettings::default().latency_warning,
            ),
            latency_critical: parse_env_duration_millis(
                "DATA_FLOW_LATENCY_CRITICAL_MS",
                FeedSettings::default().latency_critical,
            ),
        };

        let server = ServerSettings {
            health_port: parse_env_u16(
                "DATA_FLOW_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let max_entries_raw = parse_env_usize(
            "DATA_FLOW_CACHE_MAX_ENTRIES",
            CacheSettings::default().max_entries.get(),
        );
        let cache = CacheSettings {
            max_entries: non_zero("DATA_FLOW_CACHE_MAX_ENTRIES", max_entries_raw)?,
            default_ttl: parse_env_duration_secs(
                "DATA_FLOW_CACHE_TTL_SECS",
                CacheSettings::default().default_ttl,
            ),
            cleanup_interval: parse_env_duration_secs(
                "DATA_FLOW_CACHE_CLEANUP_INTERVAL_SECS",
                CacheSettings::default().cleanup_interval,
            ),
        };

        let validator = ValidatorSettings {
            max_timestamp_delay: parse_env_duration_secs(
                "DATA_FLOW_MAX_TIMESTAMP_DELAY_SECS",
                ValidatorSettings::default().max_timestamp_delay,
            ),
            max_price_change_percent: parse_env_decimal(
                "DATA_FLOW_MAX_PRICE_CHANGE_PERCENT",
                ValidatorSettings::default().max_price_change_percent,
            ),
            divergence_threshold: parse_env_f64(
                "DATA_FLOW_DIVERGENCE_THRESHOLD",
                ValidatorSettings::default().divergence_threshold,
            ),
            freshness_window: parse_env_duration_secs(
                "DATA_FLOW_FRESHNESS_WINDOW_SECS",
                ValidatorSettings::default().freshness_window,
            ),
        };

        let aggregator = AggregatorSettings {
            min_source_count: parse_env_usize(
                "DATA_FLOW_MIN_SOURCE_COUNT",
                AggregatorSettings::default().min_source_count,
            ),
            health_threshold: parse_env_f64(
                "DATA_FLOW_HEALTH_THRESHOLD",
                AggregatorSettings::default().health_threshold,
            ),
            fetch_timeout: parse_env_duration_secs(
                "DATA_FLOW_FETCH_TIMEOUT_SECS",
                AggregatorSettings::default().fetch_timeout,
            ),
        };

        let orchestrator = OrchestratorSettings {
            alert_capacity: parse_env_usize(
                "DATA_FLOW_ALERT_CAPACITY",
                OrchestratorSettings::default().alert_capacity,
            ),
            metrics_interval: parse_env_duration_millis(
                "DATA_FLOW_METRICS_INTERVAL_MS",
                OrchestratorSettings::default().metrics_interval,
            ),
            snapshot_ttl: parse_env_duration_secs(
                "DATA_FLOW_SNAPSHOT_TTL_SECS",
                OrchestratorSettings::default().snapshot_ttl,
            ),
        };

        Ok(Self {
            feed,
            server,
            cache,
            validator,
            aggregator,
            orchestrator,
        })
    }

    /// Tracker configuration derived from the feed settings.
    #[must_use]
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            probe_timeout: self.feed.probe_timeout,
            ..TrackerConfig::default()
        }
    }

    /// Latency monitor configuration derived from the feed settings.
    #[must_use]
    pub fn latency_config(&self) -> LatencyConfig {
        LatencyConfig {
            warning: self.feed.latency_warning,
            critical: self.feed.latency_critical,
            ..LatencyConfig::default()
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an invalid value.
    #[error("environment variable {key} has invalid value: {value}")]
    InvalidValue {
        /// Offending variable.
        key: String,
        /// The rejected value.
        value: String,
    },
}

fn non_zero(key: &str, value: usize) -> Result<NonZeroUsize, ConfigError> {
    NonZeroUsize::new(value).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_decimal(key: &str, default: Decimal) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
