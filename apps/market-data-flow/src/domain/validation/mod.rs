//! Snapshot Quality Gate and Anomaly Detection
//!
//! The validator admits or rejects snapshots before they reach the cache or
//! the outbound event stream, maintains per-symbol rolling baselines for
//! anomaly detection, and checks consistency across independent sources.
//!
//! # Design
//!
//! - `validate` runs structural and semantic checks. Any error blocks
//!   downstream use; warnings are surfaced but never block.
//! - `detect_anomalies` compares price and volume against a bounded rolling
//!   baseline per symbol. Confidence above 0.8 is actionable, lower values
//!   are informational.
//! - `validate_cross_sources` computes the maximum pairwise relative price
//!   divergence between fresh records of the same symbol.
//!
//! Malformed input is never a panic: it is reported as an invalid result.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::domain::snapshot::{Ohlcv, Snapshot, SourceId, Symbol};

// =============================================================================
// Configuration
// =============================================================================

/// Validator tuning knobs.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Maximum allowed distance between a record timestamp and now.
    pub max_timestamp_delay: Duration,
    /// Maximum allowed percentage change versus the previous close.
    pub max_price_change_percent: Decimal,
    /// Rolling baseline window length per symbol.
    pub history_window: usize,
    /// Minimum baseline points before anomaly detection activates.
    pub min_baseline: usize,
    /// Z-score at which a price move counts as anomalous.
    pub price_sigma: f64,
    /// Multiple of mean volume at which volume counts as anomalous.
    pub volume_multiple: f64,
    /// Maximum relative price divergence tolerated across sources.
    pub divergence_threshold: f64,
    /// Window within which two records are comparable across sources.
    pub freshness_window: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_timestamp_delay: Duration::from_secs(60),
            max_price_change_percent: Decimal::from(20),
            history_window: 100,
            min_baseline: 10,
            price_sigma: 2.0,
            volume_multiple: 4.0,
            divergence_threshold: 0.05,
            freshness_window: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Result of running the quality gate over one snapshot.
#[derive(Debug, Clone, Default)]
pub struct QualityReport {
    /// Whether the snapshot may be cached and emitted.
    pub is_valid: bool,
    /// Blocking problems.
    pub errors: Vec<String>,
    /// Non-blocking observations.
    pub warnings: Vec<String>,
}

impl QualityReport {
    fn from_checks(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Result of anomaly detection for one snapshot.
#[derive(Debug, Clone)]
pub struct AnomalyDetection {
    /// Whether the snapshot deviates from its rolling baseline.
    pub has_anomaly: bool,
    /// Human-readable description of the deviation.
    pub description: Option<String>,
    /// Confidence in `[0, 1]`. Above 0.8 is actionable.
    pub confidence: f64,
}

impl AnomalyDetection {
    const fn none() -> Self {
        Self {
            has_anomaly: false,
            description: None,
            confidence: 0.0,
        }
    }
}

/// Result of comparing fresh records of one symbol across sources.
#[derive(Debug, Clone)]
pub struct CrossSourceReport {
    /// Whether all compared sources agree within the divergence threshold.
    pub is_consistent: bool,
    /// Maximum pairwise relative price divergence observed.
    pub max_divergence: f64,
    /// Number of records that entered the comparison.
    pub compared: usize,
    /// Sources of the most-divergent pair when inconsistent.
    pub disagreeing_sources: Vec<SourceId>,
}

impl CrossSourceReport {
    fn consistent(compared: usize, max_divergence: f64) -> Self {
        Self {
            is_consistent: true,
            max_divergence,
            compared,
            disagreeing_sources: Vec::new(),
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Baseline point derived from one historical bar.
#[derive(Debug, Clone, Copy)]
struct BaselinePoint {
    close: f64,
    volume: f64,
}

/// Quality and anomaly validator with per-symbol rolling baselines.
///
/// Thread-safe: baselines are guarded by an internal lock so the validator
/// can be shared between the stream pipeline and the aggregator.
pub struct SnapshotValidator {
    config: ValidatorConfig,
    baselines: RwLock<HashMap<Symbol, VecDeque<BaselinePoint>>>,
}

impl SnapshotValidator {
    /// Create a validator with the given configuration.
    #[must_use]
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            baselines: RwLock::new(HashMap::new()),
        }
    }

    /// Create a validator with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(ValidatorConfig::default())
    }

    /// Run structural and semantic checks over one snapshot.
    ///
    /// Errors block downstream use; warnings do not.
    #[must_use]
    pub fn validate(&self, snapshot: &Snapshot) -> QualityReport {
        self.validate_at(snapshot, Utc::now())
    }

    /// `validate` against an explicit clock, for deterministic tests.
    #[must_use]
    pub fn validate_at(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> QualityReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if snapshot.symbol.trim().is_empty() {
            errors.push("symbol is empty".to_string());
        }

        let delay = (now - snapshot.timestamp).abs();
        let max_delay = chrono::Duration::from_std(self.config.max_timestamp_delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if delay > max_delay {
            errors.push(format!(
                "timestamp is {}ms away from now (max {}ms)",
                delay.num_milliseconds(),
                max_delay.num_milliseconds()
            ));
        }

        if let Some(bar) = &snapshot.ohlcv {
            Self::check_bar(bar, &mut errors, &mut warnings);
            self.check_price_change(snapshot, bar, &mut errors);
        }

        QualityReport::from_checks(errors, warnings)
    }

    fn check_bar(bar: &Ohlcv, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        if bar.close <= Decimal::ZERO {
            errors.push(format!("close price {} is not positive", bar.close));
        }
        if bar.low < Decimal::ZERO {
            errors.push(format!("low price {} is negative", bar.low));
        }
        if bar.high < bar.low {
            errors.push(format!("high {} is below low {}", bar.high, bar.low));
        }
        if bar.volume < Decimal::ZERO {
            errors.push(format!("volume {} is negative", bar.volume));
        }

        if bar.close > bar.high || bar.close < bar.low {
            warnings.push(format!(
                "close {} outside [{}, {}] range",
                bar.close, bar.low, bar.high
            ));
        }
        if bar.volume == Decimal::ZERO {
            warnings.push("volume is zero".to_string());
        }
    }

    fn check_price_change(&self, snapshot: &Snapshot, bar: &Ohlcv, errors: &mut Vec<String>) {
        let Some(previous_close) = snapshot.previous_close else {
            return;
        };
        if previous_close <= Decimal::ZERO {
            return;
        }

        let change_percent = ((bar.close - previous_close) / previous_close).abs()
            * Decimal::ONE_HUNDRED;
        if change_percent >= self.config.max_price_change_percent {
            errors.push(format!(
                "price change {change_percent:.2}% versus previous close exceeds {}%",
                self.config.max_price_change_percent
            ));
        }
    }

    /// Append one bar to the symbol's rolling baseline window.
    ///
    /// The oldest point is dropped once the window is full.
    pub fn update_historical_data(&self, symbol: &str, bar: &Ohlcv) {
        let point = BaselinePoint {
            close: bar.close.to_f64().unwrap_or_default(),
            volume: bar.volume.to_f64().unwrap_or_default(),
        };

        let mut baselines = self.baselines.write();
        let window = baselines.entry(symbol.to_string()).or_default();
        window.push_back(point);
        while window.len() > self.config.history_window {
            window.pop_front();
        }
    }

    /// Number of baseline points currently held for a symbol.
    #[must_use]
    pub fn baseline_len(&self, symbol: &str) -> usize {
        self.baselines.read().get(symbol).map_or(0, VecDeque::len)
    }

    /// Compare one snapshot against its symbol's rolling baseline.
    ///
    /// With fewer than `min_baseline` reference points the result is always
    /// non-anomalous with zero confidence.
    #[must_use]
    pub fn detect_anomalies(&self, snapshot: &Snapshot) -> AnomalyDetection {
        let Some(bar) = &snapshot.ohlcv else {
            return AnomalyDetection::none();
        };

        let baselines = self.baselines.read();
        let Some(window) = baselines.get(&snapshot.symbol) else {
            return AnomalyDetection::none();
        };
        if window.len() < self.config.min_baseline {
            return AnomalyDetection::none();
        }

        let price = bar.close.to_f64().unwrap_or_default();
        let volume = bar.volume.to_f64().unwrap_or_default();

        let (price_mean, price_std) = mean_and_std(window.iter().map(|p| p.close));
        let (volume_mean, _) = mean_and_std(window.iter().map(|p| p.volume));

        let z = z_score(price, price_mean, price_std, self.config.price_sigma);
        let price_confidence = (z / (self.config.price_sigma * 2.5)).min(1.0);

        let volume_ratio = if volume_mean > f64::EPSILON {
            volume / volume_mean
        } else {
            0.0
        };
        let volume_confidence = (volume_ratio / (self.config.volume_multiple * 2.5)).min(1.0);

        let price_anomalous = z >= self.config.price_sigma;
        let volume_anomalous = volume_ratio >= self.config.volume_multiple;

        if !price_anomalous && !volume_anomalous {
            return AnomalyDetection::none();
        }

        let mut parts = Vec::new();
        if price_anomalous {
            parts.push(format!(
                "price {price:.4} deviates {z:.2} sigma from rolling mean {price_mean:.4}"
            ));
        }
        if volume_anomalous {
            parts.push(format!(
                "volume {volume:.0} is {volume_ratio:.1}x the rolling mean {volume_mean:.0}"
            ));
        }

        AnomalyDetection {
            has_anomaly: true,
            description: Some(parts.join("; ")),
            confidence: price_confidence.max(volume_confidence).clamp(0.0, 1.0),
        }
    }

    /// Check price agreement between fresh records of the same symbol.
    ///
    /// Records older than the freshness window (relative to the newest
    /// record) or lacking a price are excluded. Fewer than two comparable
    /// records is trivially consistent.
    #[must_use]
    pub fn validate_cross_sources(
        &self,
        snapshots: &HashMap<SourceId, Snapshot>,
    ) -> CrossSourceReport {
        let mut priced: Vec<(&SourceId, &Snapshot, f64)> = snapshots
            .iter()
            .filter_map(|(id, snap)| {
                snap.price()
                    .and_then(|p| p.to_f64())
                    .filter(|p| *p > 0.0)
                    .map(|p| (id, snap, p))
            })
            .collect();

        let Some(newest) = priced.iter().map(|(_, s, _)| s.timestamp).max() else {
            return CrossSourceReport::consistent(0, 0.0);
        };

        let freshness = chrono::Duration::from_std(self.config.freshness_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let symbol = priced
            .iter()
            .find(|(_, s, _)| s.timestamp == newest)
            .map(|(_, s, _)| s.symbol.clone())
            .unwrap_or_default();
        priced.retain(|(_, s, _)| s.symbol == symbol && newest - s.timestamp <= freshness);

        if priced.len() < 2 {
            return CrossSourceReport::consistent(priced.len(), 0.0);
        }

        let mut max_divergence = 0.0_f64;
        let mut worst_pair: Vec<SourceId> = Vec::new();
        for i in 0..priced.len() {
            for j in (i + 1)..priced.len() {
                let (id_a, _, a) = priced[i];
                let (id_b, _, b) = priced[j];
                let floor = a.min(b);
                if floor <= f64::EPSILON {
                    continue;
                }
                let divergence = (a - b).abs() / floor;
                if divergence > max_divergence {
                    max_divergence = divergence;
                    worst_pair = vec![id_a.clone(), id_b.clone()];
                }
            }
        }

        if max_divergence > self.config.divergence_threshold {
            CrossSourceReport {
                is_consistent: false,
                max_divergence,
                compared: priced.len(),
                disagreeing_sources: worst_pair,
            }
        } else {
            CrossSourceReport::consistent(priced.len(), max_divergence)
        }
    }
}

fn mean_and_std(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let count = values.clone().count();
    if count == 0 {
        return (0.0, 0.0);
    }
    #[allow(clippy::cast_precision_loss)]
    let n = count as f64;
    let mean = values.clone().sum::<f64>() / n;
    let variance = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

fn z_score(value: f64, mean: f64, std: f64, sigma: f64) -> f64 {
    if std > 1e-9 {
        (value - mean).abs() / std
    } else if (value - mean).abs() > 1e-9 {
        // Constant baseline: any movement at all is a full-confidence breach.
        sigma * 2.5
    } else {
        0.0
    }
}

// =============================================================================
// Tests
// =============================================================================
