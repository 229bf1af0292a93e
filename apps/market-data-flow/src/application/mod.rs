//! Application Layer
//!
//! Use cases and port definitions.
//!
//! - `ports`: Interfaces for the stream transport and source fetchers
//! - `services`: Multi-source aggregation and flow orchestration

/// Port interfaces for external systems.
pub mod ports;

/// Application services.
pub mod services;
