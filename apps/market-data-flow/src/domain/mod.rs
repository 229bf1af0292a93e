//! Domain Layer
//!
//! Pure market-data types and synchronous validation logic with no
//! infrastructure dependencies.

/// Canonical market snapshot types.
pub mod snapshot;

/// Quality gate, anomaly detection, and cross-source consistency checks.
pub mod validation;
