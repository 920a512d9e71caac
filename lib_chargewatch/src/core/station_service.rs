//! # Station Service
//!
//! The synchronous entry points used by request handlers and the worker
//! binary: default-station provisioning, station administration, refresh on
//! demand gated by cache freshness, and a consolidated per-station view.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::configs::config_sync::{DEFAULT_SERVICE_LABEL, DEFAULT_STATION_ID};
use crate::connections::store::PortStore;
use crate::core::dispatcher::RefreshDispatcher;
use crate::core::freshness_cache::FreshnessCache;
use crate::core::refresh::{RefreshMode, RefreshReport, StationRefresher};
use crate::errors::{SyncError, SyncResult};
use crate::stations::model::{now_unix_ms, PortReading, PortRecord, PortStatus, Station, StatusSnapshot, OCCUPIED_VOLTAGE};

pub const DEFAULT_STATION_NAME: &str = "信阳学院充电桩";
const DEFAULT_STATION_PORTS: i64 = 4;

#[derive(Debug)]
pub enum RefreshOutcome {
    /// The cached snapshot is still within its TTL; nothing was done.
    Fresh,
    Refreshed(RefreshReport),
    Queued(Uuid),
}

/// Stored ports combined with the cached snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StationOverview {
    pub station: Station,
    pub ports: Vec<PortRecord>,
    pub cached: Option<StatusSnapshot>,
    pub cached_at_ms: Option<i64>,
    pub cache_fresh: bool,
}

pub struct StationService {
    store: Arc<dyn PortStore>,
    cache: Arc<FreshnessCache>,
    refresher: Arc<StationRefresher>,
    dispatcher: Option<RefreshDispatcher>,
}

impl StationService {
    /// With a dispatcher, stale stations are queued instead of refreshed inline.
    pub fn new(
        store: Arc<dyn PortStore>,
        refresher: Arc<StationRefresher>,
        dispatcher: Option<RefreshDispatcher>,
    ) -> Self {
        Self {
            store,
            cache: refresher.cache().clone(),
            refresher,
            dispatcher,
        }
    }

    /// The default station, provisioned with four free ports when no station is active.
    pub async fn default_station(&self) -> SyncResult<Station> {
        let active = self.store.list_active_stations().await?;
        if let Some(station) = active.iter().find(|s| s.id == DEFAULT_STATION_ID) {
            return Ok(station.clone());
        }
        if let Some(first) = active.into_iter().next() {
            return Ok(first);
        }

        let station = self.store.upsert_station(DEFAULT_STATION_ID, DEFAULT_STATION_NAME).await?;
        if self.store.ports_for_station(DEFAULT_STATION_ID).await?.is_empty() {
            let now = now_unix_ms();
            let seed: Vec<PortReading> = (1..=DEFAULT_STATION_PORTS)
                .map(|port_number| PortReading {
                    port_number,
                    status: PortStatus::Free,
                    service: DEFAULT_SERVICE_LABEL.to_string(),
                    voltage: OCCUPIED_VOLTAGE,
                    current: 0.0,
                    observed_at_ms: now,
                })
                .collect();
            self.refresher.reconciler().reconcile(DEFAULT_STATION_ID, &seed).await?;
        }
        tracing::info!(station_id = DEFAULT_STATION_ID, "default station provisioned");
        Ok(station)
    }

    pub async fn add_station(&self, station_id: &str, name: &str) -> SyncResult<Station> {
        let station_id = station_id.trim();
        if station_id.is_empty() {
            return Err(SyncError::InvalidInput("station id must not be empty".into()));
        }
        let name = match name.trim() {
            "" => format!("充电桩 {station_id}"),
            n => n.to_string(),
        };
        let station = self.store.upsert_station(station_id, &name).await?;
        tracing::info!(station_id, "station added");
        Ok(station)
    }

    /// Soft delete. The station's rows stay; its cache entry goes.
    pub async fn deactivate_station(&self, station_id: &str) -> SyncResult<bool> {
        let changed = self.store.deactivate_station(station_id).await?;
        if changed {
            if let Err(e) = self.cache.invalidate(station_id).await {
                tracing::warn!(station_id, error = %e, "cache invalidation failed");
            }
            tracing::info!(station_id, "station deactivated");
        }
        Ok(changed)
    }

    pub async fn list_active_stations(&self) -> SyncResult<Vec<Station>> {
        self.store.list_active_stations().await
    }

    /// Refreshes a station unless its cached snapshot is still fresh.
    pub async fn refresh_station(&self, station_id: &str) -> SyncResult<RefreshOutcome> {
        match self.cache.is_fresh(station_id).await {
            Ok(true) => return Ok(RefreshOutcome::Fresh),
            Ok(false) => {}
            Err(e) => tracing::warn!(station_id, error = %e, "cache unavailable, refreshing anyway"),
        }

        match &self.dispatcher {
            Some(dispatcher) => Ok(RefreshOutcome::Queued(dispatcher.submit(station_id).await?)),
            None => {
                let report = self.refresher.refresh(station_id, RefreshMode::AcceptDegraded).await?;
                Ok(RefreshOutcome::Refreshed(report))
            }
        }
    }

    /// Refreshes every active station. One station's failure does not stop the others.
    pub async fn refresh_all_active(&self) -> SyncResult<Vec<(String, SyncResult<RefreshOutcome>)>> {
        let stations = self.store.list_active_stations().await?;
        let mut results = Vec::with_capacity(stations.len());
        for station in stations {
            let outcome = self.refresh_station(&station.id).await;
            if let Err(e) = &outcome {
                tracing::warn!(station_id = %station.id, error = %e, "station refresh failed");
            }
            results.push((station.id, outcome));
        }
        Ok(results)
    }

    pub async fn station_overview(&self, station_id: &str) -> SyncResult<Option<StationOverview>> {
        let Some(station) = self.store.get_station(station_id).await? else {
            return Ok(None);
        };
        let ports = self.store.ports_for_station(station_id).await?;
        let entry = match self.cache.get_entry(station_id).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(station_id, error = %e, "cache unavailable for overview");
                None
            }
        };
        Ok(Some(StationOverview {
            station,
            ports,
            cache_fresh: entry.as_ref().is_some_and(|e| e.fresh),
            cached_at_ms: entry.as_ref().map(|e| e.captured_at_ms),
            cached: entry.map(|e| e.snapshot),
        }))
    }
}
