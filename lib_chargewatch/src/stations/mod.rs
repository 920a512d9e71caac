//! # Stations
//!
//! Domain types for stations, ports and status snapshots, the vendor status
//! client that produces snapshots, and the synthetic generator it falls back
//! to when the vendor cannot be reached or trusted.

/// Stations, ports, readings and snapshots.
pub mod model;
/// The vendor status client with graceful degradation.
pub mod status_client;
/// Plausible fabricated snapshots for degraded operation.
pub mod synthetic;

pub use model::now_unix_ms;
pub use status_client::{ClientStats, ClientStatsSnapshot, StationClient, StatusSource};
pub use synthetic::SyntheticGenerator;
