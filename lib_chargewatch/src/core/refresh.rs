//! # Refresh Pipeline
//!
//! One unit of refresh work for a station: fetch, reconcile, then cache.
//! Shared by the synchronous path and the dispatcher's workers, which differ
//! only in how a degraded fetch is treated.

use std::sync::Arc;

use crate::core::freshness_cache::FreshnessCache;
use crate::core::reconciler::{ReconcileOutcome, Reconciler};
use crate::errors::SyncResult;
use crate::stations::model::{SnapshotOrigin, StatusSnapshot};
use crate::stations::status_client::StatusSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Reconcile whatever the client returns, synthetic data included.
    AcceptDegraded,
    /// A fallback snapshot fails the refresh with its failure class and nothing is persisted.
    Strict,
}

#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub station_id: String,
    pub snapshot: StatusSnapshot,
    pub outcome: ReconcileOutcome,
}

impl RefreshReport {
    pub fn origin(&self) -> &SnapshotOrigin {
        &self.snapshot.origin
    }
}

pub struct StationRefresher {
    source: Arc<dyn StatusSource>,
    reconciler: Arc<Reconciler>,
    cache: Arc<FreshnessCache>,
}

impl StationRefresher {
    pub fn new(source: Arc<dyn StatusSource>, reconciler: Arc<Reconciler>, cache: Arc<FreshnessCache>) -> Self {
        Self {
            source,
            reconciler,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<FreshnessCache> {
        &self.cache
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Fetches, reconciles and caches one station.
    ///
    /// A cache write failure is logged and does not fail the refresh; storage already holds the result.
    pub async fn refresh(&self, station_id: &str, mode: RefreshMode) -> SyncResult<RefreshReport> {
        let snapshot = self.source.fetch_status(station_id).await;

        if mode == RefreshMode::Strict {
            if let Some(failure) = snapshot.origin.failure() {
                return Err(failure.to_error());
            }
        }

        let outcome = self.reconciler.reconcile(station_id, &snapshot.ports).await?;

        if let Err(e) = self.cache.set(station_id, &snapshot).await {
            tracing::warn!(station_id, error = %e, "cache update failed after reconcile");
        }

        tracing::info!(
            station_id,
            ports = snapshot.ports.len(),
            synthetic = snapshot.origin.is_synthetic(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            "station refreshed"
        );

        Ok(RefreshReport {
            station_id: station_id.to_string(),
            snapshot,
            outcome,
        })
    }
}
