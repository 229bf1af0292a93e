//! Infrastructure Layer
//!
//! Adapters and external integrations.

/// Bounded TTL + LRU snapshot cache.
pub mod cache;

/// Configuration loading.
pub mod config;

/// Connection quality tracking and feed latency monitoring.
pub mod connection;

/// Outbound event bus.
pub mod events;

/// Wire messages, codec, and WebSocket transport.
pub mod feed;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics.
pub mod metrics;

/// Tracing and OpenTelemetry setup.
pub mod telemetry;
