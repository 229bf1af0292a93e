//! Multi-Source Aggregator
//!
//! Pull-based aggregation of snapshots across redundant upstream sources.
//! Sources are tried in priority order with a per-fetch timeout; failures
//! decrease a source's health score and trigger failover to the next
//! healthy source. After a primary success, the remaining healthy sources
//! are collected best-effort within the same deadline so their answers can
//! be cross-validated.
//!
//! Aggregation never raises: every call returns an [`AggregationResult`]
//! that callers must check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;

use crate::application::ports::{FetchError, SourceFetcher};
use crate::domain::snapshot::{Snapshot, SourceId, Symbol};
use crate::domain::validation::{CrossSourceReport, SnapshotValidator};

// =============================================================================
// Health policy
// =============================================================================

/// Outcome of one fetch attempt, as seen by the health policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The source returned a snapshot in time.
    Success,
    /// The source failed or timed out.
    Failure,
}

/// Maps a source's current health score and a fetch outcome to its new
/// score. The aggregator clamps the result to `[0, 100]`.
pub type HealthPolicy = Arc<dyn Fn(f64, FetchOutcome) -> f64 + Send + Sync>;

/// Additive health policy: a fixed reward per success, a fixed penalty per
/// failure.
#[must_use]
pub fn additive_policy(success_delta: f64, failure_delta: f64) -> HealthPolicy {
    Arc::new(move |score, outcome| match outcome {
        FetchOutcome::Success => score + success_delta,
        FetchOutcome::Failure => score - failure_delta,
    })
}

// =============================================================================
// Configuration and registry
// =============================================================================

/// Aggregator tuning knobs.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Minimum healthy sources required before any fetch is attempted.
    pub min_source_count: usize,
    /// Health score a source must exceed to count as healthy.
    pub health_threshold: f64,
    /// Deadline for each fetch, and for the best-effort secondary sweep.
    pub fetch_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_source_count: 1,
            health_threshold: 50.0,
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

/// One registered upstream source.
pub struct DataSource {
    /// Unique source id.
    pub id: SourceId,
    /// Human-readable name.
    pub name: String,
    /// Lower value is preferred.
    pub priority: u8,
    /// Disabled sources are never fetched.
    pub enabled: bool,
    /// Reliability score in `[0, 100]`.
    pub health_score: f64,
    /// The fetch implementation.
    pub fetcher: Arc<dyn SourceFetcher>,
}

impl DataSource {
    /// Create an enabled source at full health.
    #[must_use]
    pub fn new(
        id: impl Into<SourceId>,
        name: impl Into<String>,
        priority: u8,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            enabled: true,
            health_score: 100.0,
            fetcher,
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// One source failure recorded during aggregation.
#[derive(Debug, Clone)]
pub struct SourceError {
    /// Failed source.
    pub source: SourceId,
    /// What went wrong.
    pub message: String,
}

/// Result of one `aggregate` call. Transient, never persisted.
#[derive(Debug, Clone)]
pub struct AggregationResult {
    /// Whether any source produced a snapshot.
    pub success: bool,
    /// The primary source's snapshot.
    pub data: Option<Snapshot>,
    /// Sources that responded, primary first.
    pub sources: Vec<SourceId>,
    /// Source whose snapshot is in `data`.
    pub primary_source: Option<SourceId>,
    /// Whether the primary is not the top-priority healthy source.
    pub fallback_used: bool,
    /// Failures accumulated along the way.
    pub errors: Vec<SourceError>,
    /// Cross-source consistency report, when at least two sources answered.
    pub validation: Option<CrossSourceReport>,
}

impl AggregationResult {
    fn failure(errors: Vec<SourceError>) -> Self {
        Self {
            success: false,
            data: None,
            sources: Vec::new(),
            primary_source: None,
            fallback_used: false,
            errors,
            validation: None,
        }
    }
}

/// Registry-level statistics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct AggregatorStats {
    /// Registered sources.
    pub total_sources: usize,
    /// Enabled sources.
    pub enabled_sources: usize,
    /// Enabled sources above the health threshold.
    pub healthy_sources: usize,
    /// Mean health score across all registered sources.
    pub avg_health_score: f64,
}

// =============================================================================
// Aggregator
// =============================================================================

/// Priority-ordered multi-source aggregator with failover.
///
/// The registry stays sorted ascending by priority. Concurrent `aggregate`
/// calls are independent; calls for the same symbol are not coalesced.
pub struct SourceAggregator {
    config: AggregatorConfig,
    registry: RwLock<Vec<DataSource>>,
    validator: Arc<SnapshotValidator>,
    policy: HealthPolicy,
}

impl SourceAggregator {
    /// Create an aggregator with the default additive health policy
    /// (+5 per success, −15 per failure).
    #[must_use]
    pub fn new(config: AggregatorConfig, validator: Arc<SnapshotValidator>) -> Self {
        Self::with_policy(config, validator, additive_policy(5.0, 15.0))
    }

    /// Create an aggregator with a custom health policy.
    #[must_use]
    pub fn with_policy(
        config: AggregatorConfig,
        validator: Arc<SnapshotValidator>,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            config,
            registry: RwLock::new(Vec::new()),
            validator,
            policy,
        }
    }

    /// Register a source, keeping the registry sorted by priority.
    pub fn register_source(&self, source: DataSource) {
        let mut registry = self.registry.write();
        registry.push(source);
        registry.sort_by_key(|s| s.priority);
    }

    /// Remove a source by id. Returns whether it existed.
    pub fn unregister_source(&self, id: &str) -> bool {
        let mut registry = self.registry.write();
        let before = registry.len();
        registry.retain(|s| s.id != id);
        registry.len() != before
    }

    /// Enable or disable a source. Returns whether it exists.
    pub fn set_source_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut registry = self.registry.write();
        registry
            .iter_mut()
            .find(|s| s.id == id)
            .map(|s| s.enabled = enabled)
            .is_some()
    }

    /// Ids of sources that are enabled and above the health threshold,
    /// in priority order.
    #[must_use]
    pub fn healthy_sources(&self) -> Vec<SourceId> {
        self.registry
            .read()
            .iter()
            .filter(|s| s.enabled && s.health_score > self.config.health_threshold)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Current health score of a source.
    #[must_use]
    pub fn source_health(&self, id: &str) -> Option<f64> {
        self.registry
            .read()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.health_score)
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> AggregatorStats {
        let registry = self.registry.read();
        let total = registry.len();
        let enabled = registry.iter().filter(|s| s.enabled).count();
        let healthy = registry
            .iter()
            .filter(|s| s.enabled && s.health_score > self.config.health_threshold)
            .count();
        let avg = if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                registry.iter().map(|s| s.health_score).sum::<f64>() / total as f64
            }
        };

        AggregatorStats {
            total_sources: total,
            enabled_sources: enabled,
            healthy_sources: healthy,
            avg_health_score: avg,
        }
    }

    /// Aggregate a snapshot for one symbol across the healthy sources.
    ///
    /// Tries sources in priority order under the per-fetch timeout; the
    /// first success becomes the primary. Remaining healthy sources are then
    /// collected within the same deadline for cross-validation. An
    /// inconsistent cross-source report does NOT fail the call — it is
    /// attached for the caller to downgrade confidence.
    pub async fn aggregate(&self, symbol: &Symbol) -> AggregationResult {
        let healthy: Vec<(SourceId, Arc<dyn SourceFetcher>)> = {
            let registry = self.registry.read();
            registry
                .iter()
                .filter(|s| s.enabled && s.health_score > self.config.health_threshold)
                .map(|s| (s.id.clone(), Arc::clone(&s.fetcher)))
                .collect()
        };

        if healthy.is_empty() {
            return AggregationResult::failure(vec![SourceError {
                source: "registry".to_string(),
                message: "no healthy sources available".to_string(),
            }]);
        }
        if healthy.len() < self.config.min_source_count {
            return AggregationResult::failure(vec![SourceError {
                source: "registry".to_string(),
                message: format!(
                    "insufficient sources: {} healthy, {} required",
                    healthy.len(),
                    self.config.min_source_count
                ),
            }]);
        }

        let top_priority_id = healthy[0].0.clone();
        let mut errors = Vec::new();
        let mut responded: Vec<(SourceId, Snapshot)> = Vec::new();
        let mut primary: Option<SourceId> = None;
        let mut primary_index = 0;

        for (index, (id, fetcher)) in healthy.iter().enumerate() {
            match self.fetch_with_timeout(fetcher, symbol).await {
                Ok(snapshot) => {
                    self.record_outcome(id, FetchOutcome::Success);
                    tracing::debug!(source = %id, %symbol, "Primary fetch succeeded");
                    responded.push((id.clone(), snapshot));
                    primary = Some(id.clone());
                    primary_index = index;
                    break;
                }
                Err(error) => {
                    self.record_outcome(id, FetchOutcome::Failure);
                    tracing::warn!(source = %id, %symbol, %error, "Source fetch failed, failing over");
                    errors.push(SourceError {
                        source: id.clone(),
                        message: error.to_string(),
                    });
                }
            }
        }

        let Some(primary_id) = primary else {
            return AggregationResult::failure(errors);
        };

        // Best-effort sweep of the remaining healthy sources, bounded by the
        // same per-fetch deadline since they all run concurrently.
        let remaining = &healthy[primary_index + 1..];
        let sweeps = join_all(remaining.iter().map(|(id, fetcher)| {
            let id = id.clone();
            async move { (id, self.fetch_with_timeout(fetcher, symbol).await) }
        }))
        .await;

        for (id, outcome) in sweeps {
            match outcome {
                Ok(snapshot) => {
                    self.record_outcome(&id, FetchOutcome::Success);
                    responded.push((id, snapshot));
                }
                Err(error) => {
                    self.record_outcome(&id, FetchOutcome::Failure);
                    errors.push(SourceError {
                        source: id,
                        message: error.to_string(),
                    });
                }
            }
        }

        let validation = if responded.len() >= 2 {
            let by_source: HashMap<SourceId, Snapshot> = responded.iter().cloned().collect();
            let report = self.validator.validate_cross_sources(&by_source);
            if !report.is_consistent {
                tracing::warn!(
                    %symbol,
                    divergence = report.max_divergence,
                    sources = ?report.disagreeing_sources,
                    "Cross-source price divergence"
                );
            }
            Some(report)
        } else {
            None
        };

        let data = responded
            .iter()
            .find(|(id, _)| *id == primary_id)
            .map(|(_, snapshot)| snapshot.clone());

        AggregationResult {
            success: true,
            data,
            sources: responded.into_iter().map(|(id, _)| id).collect(),
            fallback_used: primary_id != top_priority_id,
            primary_source: Some(primary_id),
            errors,
            validation,
        }
    }

    async fn fetch_with_timeout(
        &self,
        fetcher: &Arc<dyn SourceFetcher>,
        symbol: &Symbol,
    ) -> Result<Snapshot, FetchError> {
        match tokio::time::timeout(self.config.fetch_timeout, fetcher.fetch(symbol)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(FetchError::Timeout(self.config.fetch_timeout)),
        }
    }

    fn record_outcome(&self, id: &str, outcome: FetchOutcome) {
        let mut registry = self.registry.write();
        if let Some(source) = registry.iter_mut().find(|s| s.id == id) {
            source.health_score = (self.policy)(source.health_score, outcome).clamp(0.0, 100.0);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use crate::domain::snapshot::Ohlcv;

    use super::*;

    enum Behavior {
        Succeed { price: &'static str },
        Fail,
        Hang,
    }

    struct FakeFetcher {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceFetcher for FakeFetcher {
        async fn fetch(&self, symbol: &str) -> Result<Snapshot, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Succeed { price } => {
                    let close = Decimal::from_str(price).unwrap();
                    Ok(Snapshot::new(symbol.to_string(), Utc::now()).with_ohlcv(Ohlcv {
                        date: Utc::now(),
                        open: close,
                        high: close,
                        low: close,
                        close,
                        volume: Decimal::from(1000),
                    }))
                }
                Behavior::Fail => Err(FetchError::Unavailable("fake outage".to_string())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("hanging fetcher should be timed out")
                }
            }
        }
    }

    fn aggregator(config: AggregatorConfig) -> SourceAggregator {
        SourceAggregator::new(config, Arc::new(SnapshotValidator::with_defaults()))
    }

    fn fast_config() -> AggregatorConfig {
        AggregatorConfig {
            fetch_timeout: Duration::from_millis(100),
            ..AggregatorConfig::default()
        }
    }

    #[tokio::test]
    async fn primary_success_uses_top_priority_source() {
        let agg = aggregator(fast_config());
        let a = FakeFetcher::new(Behavior::Succeed { price: "100" });
        let b = FakeFetcher::new(Behavior::Succeed { price: "100.01" });
        agg.register_source(DataSource::new("a", "Alpha", 1, a));
        agg.register_source(DataSource::new("b", "Beta", 2, b));

        let result = agg.aggregate(&"AAPL".to_string()).await;

        assert!(result.success);
        assert_eq!(result.primary_source.as_deref(), Some("a"));
        assert!(!result.fallback_used);
        assert!(result.data.is_some());
    }

    #[tokio::test]
    async fn primary_failure_fails_over_with_errors() {
        let agg = aggregator(fast_config());
        let a = FakeFetcher::new(Behavior::Fail);
        let b = FakeFetcher::new(Behavior::Succeed { price: "100" });
        agg.register_source(DataSource::new("a", "Alpha", 1, a));
        agg.register_source(DataSource::new("b", "Beta", 2, b));

        let result = agg.aggregate(&"AAPL".to_string()).await;

        assert!(result.success);
        assert_eq!(result.primary_source.as_deref(), Some("b"));
        assert!(result.fallback_used);
        assert!(!result.errors.is_empty());
    }

    #[tokio::test]
    async fn registration_order_does_not_beat_priority() {
        let agg = aggregator(fast_config());
        let b = FakeFetcher::new(Behavior::Succeed { price: "100" });
        let a = FakeFetcher::new(Behavior::Succeed { price: "100" });
        agg.register_source(DataSource::new("b", "Beta", 2, b));
        agg.register_source(DataSource::new("a", "Alpha", 1, a));

        let result = agg.aggregate(&"AAPL".to_string()).await;
        assert_eq!(result.primary_source.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn zero_sources_fails_without_fetching() {
        let agg = aggregator(fast_config());
        let result = agg.aggregate(&"AAPL".to_string()).await;

        assert!(!result.success);
        assert!(result.data.is_none());
        assert!(
            result.errors[0].message.contains("no healthy sources"),
            "{}",
            result.errors[0].message
        );
    }

    #[tokio::test]
    async fn below_min_source_count_fails_fast() {
        let config = AggregatorConfig {
            min_source_count: 2,
            ..fast_config()
        };
        let agg = aggregator(config);
        let a = FakeFetcher::new(Behavior::Succeed { price: "100" });
        agg.register_source(DataSource::new("a", "Alpha", 1, Arc::clone(&a) as _));

        let result = agg.aggregate(&"AAPL".to_string()).await;

        assert!(!result.success);
        assert!(result.errors[0].message.contains("insufficient sources"));
        assert_eq!(a.calls(), 0, "no fetch may be attempted");
    }

    #[tokio::test]
    async fn timeout_counts_as_failure_and_fails_over() {
        let agg = aggregator(fast_config());
        let a = FakeFetcher::new(Behavior::Hang);
        let b = FakeFetcher::new(Behavior::Succeed { price: "100" });
        agg.register_source(DataSource::new("a", "Alpha", 1, a));
        agg.register_source(DataSource::new("b", "Beta", 2, b));

        let result = agg.aggregate(&"AAPL".to_string()).await;

        assert!(result.success);
        assert!(result.fallback_used);
        assert!(result.errors.iter().any(|e| e.message.contains("timed out")));
        assert!(agg.source_health("a").unwrap() < 100.0);
    }

    #[tokio::test]
    async fn all_sources_failing_returns_failure() {
        let agg = aggregator(fast_config());
        agg.register_source(DataSource::new(
            "a",
            "Alpha",
            1,
            FakeFetcher::new(Behavior::Fail) as _,
        ));
        agg.register_source(DataSource::new(
            "b",
            "Beta",
            2,
            FakeFetcher::new(Behavior::Fail) as _,
        ));

        let result = agg.aggregate(&"AAPL".to_string()).await;

        assert!(!result.success);
        assert!(result.data.is_none());
        assert_eq!(result.errors.len(), 2);
    }

    #[tokio::test]
    async fn secondary_sources_are_collected_for_cross_validation() {
        let agg = aggregator(fast_config());
        let a = FakeFetcher::new(Behavior::Succeed { price: "100" });
        let b = FakeFetcher::new(Behavior::Succeed { price: "130" });
        agg.register_source(DataSource::new("a", "Alpha", 1, a));
        agg.register_source(DataSource::new("b", "Beta", 2, Arc::clone(&b) as _));

        let result = agg.aggregate(&"AAPL".to_string()).await;

        assert!(result.success, "inconsistency must not fail aggregation");
        assert_eq!(result.sources.len(), 2);
        assert_eq!(b.calls(), 1);
        let validation = result.validation.expect("two responders -> validation");
        assert!(!validation.is_consistent);
    }

    #[tokio::test]
    async fn single_responder_attaches_no_validation() {
        let agg = aggregator(fast_config());
        agg.register_source(DataSource::new(
            "a",
            "Alpha",
            1,
            FakeFetcher::new(Behavior::Succeed { price: "100" }) as _,
        ));

        let result = agg.aggregate(&"AAPL".to_string()).await;
        assert!(result.validation.is_none());
    }

    #[tokio::test]
    async fn unhealthy_source_is_skipped() {
        let agg = aggregator(fast_config());
        let a = FakeFetcher::new(Behavior::Fail);
        let b = FakeFetcher::new(Behavior::Succeed { price: "100" });
        agg.register_source(DataSource::new("a", "Alpha", 1, Arc::clone(&a) as _));
        agg.register_source(DataSource::new("b", "Beta", 2, b));

        // Drive source a below the 50-point threshold.
        for _ in 0..4 {
            let _ = agg.aggregate(&"AAPL".to_string()).await;
        }
        assert!(agg.source_health("a").unwrap() <= 50.0);
        let calls_before = a.calls();

        let result = agg.aggregate(&"AAPL".to_string()).await;
        assert!(result.success);
        assert!(!result.errors.iter().any(|e| e.source == "a"));
        assert_eq!(a.calls(), calls_before, "unhealthy source must not be fetched");
    }

    #[tokio::test]
    async fn health_score_recovers_on_success_and_is_clamped() {
        let agg = aggregator(fast_config());
        let a = FakeFetcher::new(Behavior::Succeed { price: "100" });
        agg.register_source(DataSource::new("a", "Alpha", 1, a));

        for _ in 0..5 {
            let _ = agg.aggregate(&"AAPL".to_string()).await;
        }
        assert!((agg.source_health("a").unwrap() - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn custom_policy_is_applied() {
        let validator = Arc::new(SnapshotValidator::with_defaults());
        let agg = SourceAggregator::with_policy(
            fast_config(),
            validator,
            Arc::new(|score, outcome| match outcome {
                FetchOutcome::Success => score,
                FetchOutcome::Failure => score / 2.0,
            }),
        );
        agg.register_source(DataSource::new(
            "a",
            "Alpha",
            1,
            FakeFetcher::new(Behavior::Fail) as _,
        ));

        let _ = agg.aggregate(&"AAPL".to_string()).await;
        assert!((agg.source_health("a").unwrap() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn disabled_source_is_not_healthy() {
        let agg = aggregator(fast_config());
        agg.register_source(DataSource::new(
            "a",
            "Alpha",
            1,
            FakeFetcher::new(Behavior::Succeed { price: "100" }) as _,
        ));
        assert!(agg.set_source_enabled("a", false));

        assert!(agg.healthy_sources().is_empty());
        let result = agg.aggregate(&"AAPL".to_string()).await;
        assert!(!result.success);
    }

    #[test]
    fn unregister_removes_source() {
        let agg = aggregator(fast_config());
        agg.register_source(DataSource::new(
            "a",
            "Alpha",
            1,
            FakeFetcher::new(Behavior::Fail) as _,
        ));
        assert!(agg.unregister_source("a"));
        assert!(!agg.unregister_source("a"));
        assert_eq!(agg.stats().total_sources, 0);
    }

    #[test]
    fn stats_reflect_registry() {
        let agg = aggregator(fast_config());
        agg.register_source(DataSource::new(
            "a",
            "Alpha",
            1,
            FakeFetcher::new(Behavior::Fail) as _,
        ));
        agg.register_source(DataSource::new(
            "b",
            "Beta",
            2,
            FakeFetcher::new(Behavior::Fail) as _,
        ));
        agg.set_source_enabled("b", false);

        let stats = agg.stats();
        assert_eq!(stats.total_sources, 2);
        assert_eq!(stats.enabled_sources, 1);
        assert_eq!(stats.healthy_sources, 1);
        assert!((stats.avg_health_score - 100.0).abs() < f64::EPSILON);
    }
}
