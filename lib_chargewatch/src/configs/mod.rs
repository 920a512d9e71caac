//! # Configuration Modules
//!
//! This module aggregates the configuration model of the synchronization engine:
//! vendor credentials, network budgets, cache TTL, task retry policy, the
//! synthetic fallback profile table and the storage location.

/// Provides the `SyncConfig` model with defaults, file/environment loading and validation.
pub mod config_sync;
