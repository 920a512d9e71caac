//! # lib_chargewatch
//!
//! The station-status synchronization engine. It polls a third-party vendor API
//! for per-port charging status, keeps a freshness-gated cache of the last
//! snapshot per station, and reconciles fetched readings into durable storage,
//! either directly or through a retrying task dispatcher.
//!
//! ## Layout:
//!
//! - **`signing`**: deterministic request signatures for the vendor API.
//! - **`retrieve`**: the pooled, retrying HTTP client.
//! - **`stations`**: domain model, the vendor status client and its synthetic fallback.
//! - **`connections`**: cache backends and the durable SQLite store.
//! - **`core`**: freshness cache, reconciliation, refresh pipeline, dispatcher and service.
//! - **`configs`** / **`loggers`** / **`errors`**: the ambient stack.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod connections;
pub mod core;
pub mod errors;
pub mod loggers;
pub mod retrieve;
pub mod signing;
pub mod stations;

// Re-export the types most callers need.
pub use configs::config_sync::SyncConfig;
pub use errors::{SyncError, SyncResult};
pub use stations::model::{PortReading, PortRecord, PortStatus, SnapshotOrigin, StatusSnapshot};
