//! # Logging
//!
//! Installs the process-wide `tracing` subscriber: an `EnvFilter`, a console
//! layer and an optional daily-rotating JSON file layer.

/// Subscriber setup and log-file housekeeping.
pub mod tracing_setup;

pub use tracing_setup::{init_tracing, prune_old_logs, LoggingGuard};
