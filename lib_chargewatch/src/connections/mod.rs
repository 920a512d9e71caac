//! # Connections Module
//!
//! Handles the external stores the engine talks to: cache backends for the
//! freshness cache and the durable port store.

/// The cache backend contract and the in-process map backend.
pub mod cache_backend;

/// Redis backend for multi-node deployments.
#[cfg(feature = "redis-cache")]
pub mod cache_redis;

/// The narrow storage contract consumed by reconciliation.
pub mod store;

/// SQLite implementation of the storage contract.
pub mod db_sqlite;

pub use cache_backend::{CacheBackend, MemoryBackend};
#[cfg(feature = "redis-cache")]
pub use cache_redis::RedisBackend;
pub use db_sqlite::SqliteStore;
pub use store::{PortStore, PortTransaction};
