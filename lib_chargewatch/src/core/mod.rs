//! # Core Engine Module
//!
//! The synchronization engine proper. Leaf-first:
//!
//! - **`freshness_cache`**: TTL-gated last snapshot per station over a pluggable backend.
//! - **`reconciler`**: batched, per-station-serialized merge of readings into storage.
//! - **`refresh`**: fetch, reconcile, cache as one unit of work.
//! - **`dispatcher`**: worker pool with bounded retries and exponential backoff.
//! - **`station_service`**: the synchronous path and station administration.

/// TTL-based snapshot cache.
pub mod freshness_cache;
/// Batched reconciliation into durable storage.
pub mod reconciler;
/// The fetch, reconcile, cache pipeline.
pub mod refresh;
/// Asynchronous task dispatch with retries.
pub mod dispatcher;
/// Station administration and on-demand refresh.
pub mod station_service;

pub use dispatcher::{DispatcherConfig, RefreshDispatcher, TaskRecord, TaskState};
pub use freshness_cache::{CacheEntry, FreshnessCache};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use refresh::{RefreshMode, RefreshReport, StationRefresher};
pub use station_service::{RefreshOutcome, StationOverview, StationService};
