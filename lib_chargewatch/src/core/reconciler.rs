//! # Reconciliation Engine
//!
//! Merges port readings into durable storage. Per call and per station the
//! engine performs one batched read of the affected ports, updates or inserts
//! each row against that lookup, and commits once. Any failure rolls the whole
//! call back.
//!
//! Writes for a station are serialized by an async lock held across the
//! read-then-write transaction, so overlapping refreshes of one station
//! cannot interleave. A reading older than the stored row is skipped, which
//! keeps a slow fetch from overwriting a newer one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::connections::store::{PortStore, PortTransaction};
use crate::errors::{SyncError, SyncResult};
use crate::stations::model::{PortReading, PortRecord};

/// Row counts of one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub skipped_stale: usize,
}

impl ReconcileOutcome {
    fn absorb(&mut self, other: ReconcileOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped_stale += other.skipped_stale;
    }
}

/// One async lock per station id, dropped from the map once nobody holds it.
#[derive(Default)]
struct StationLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl StationLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(&self, station_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .map()
            .entry(station_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn release(&self, station_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut map = self.map();
        // Only the map itself still refers to the lock.
        if map.get(station_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(station_id);
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn PortStore>,
    locks: StationLocks,
}

impl Reconciler {
    pub fn new(store: Arc<dyn PortStore>) -> Self {
        Self {
            store,
            locks: StationLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PortStore> {
        &self.store
    }

    /// Reconciles one station's readings in a single transaction.
    ///
    /// # Errors
    /// `SyncError::Storage` after rolling back every write of this call.
    pub async fn reconcile(&self, station_id: &str, readings: &[PortReading]) -> SyncResult<ReconcileOutcome> {
        if station_id.is_empty() {
            return Err(SyncError::InvalidInput("station id must not be empty".into()));
        }
        if readings.is_empty() {
            return Ok(ReconcileOutcome::default());
        }

        let guard = self.locks.acquire(station_id).await;
        let result = self.run_transaction(&[(station_id, readings)]).await;
        self.locks.release(station_id, guard);

        if let Ok(outcome) = &result {
            tracing::debug!(
                station_id,
                inserted = outcome.inserted,
                updated = outcome.updated,
                skipped = outcome.skipped_stale,
                "reconciled station"
            );
        }
        result
    }

    /// Reconciles readings for many stations with a single final commit.
    ///
    /// Readings are grouped by station. Storage round trips grow with the
    /// number of distinct stations, not ports.
    pub async fn reconcile_batch<I>(&self, readings: I) -> SyncResult<ReconcileOutcome>
    where
        I: IntoIterator<Item = (String, PortReading)>,
    {
        let mut grouped: BTreeMap<String, Vec<PortReading>> = BTreeMap::new();
        for (station_id, reading) in readings {
            if station_id.is_empty() {
                return Err(SyncError::InvalidInput("station id must not be empty".into()));
            }
            grouped.entry(station_id).or_default().push(reading);
        }
        if grouped.is_empty() {
            return Ok(ReconcileOutcome::default());
        }

        // BTreeMap order gives every batch the same lock order.
        let mut guards = Vec::with_capacity(grouped.len());
        for station_id in grouped.keys() {
            guards.push((station_id.as_str(), self.locks.acquire(station_id).await));
        }

        let work: Vec<(&str, &[PortReading])> = grouped
            .iter()
            .map(|(id, list)| (id.as_str(), list.as_slice()))
            .collect();
        let result = self.run_transaction(&work).await;

        for (station_id, guard) in guards {
            self.locks.release(station_id, guard);
        }

        if let Ok(outcome) = &result {
            tracing::debug!(
                stations = work.len(),
                inserted = outcome.inserted,
                updated = outcome.updated,
                "reconciled batch"
            );
        }
        result
    }

    async fn run_transaction(&self, work: &[(&str, &[PortReading])]) -> SyncResult<ReconcileOutcome> {
        let mut tx = self.store.begin().await?;

        let mut total = ReconcileOutcome::default();
        for (station_id, readings) in work {
            match apply_station(tx.as_mut(), station_id, readings).await {
                Ok(outcome) => total.absorb(outcome),
                Err(error) => {
                    if let Err(rollback_error) = tx.rollback().await {
                        tracing::error!(station_id, error = %rollback_error, "rollback failed");
                    }
                    tracing::warn!(station_id, error = %error, "reconciliation rolled back");
                    return Err(error);
                }
            }
        }

        tx.commit().await?;
        Ok(total)
    }
}

async fn apply_station(
    tx: &mut dyn PortTransaction,
    station_id: &str,
    readings: &[PortReading],
) -> SyncResult<ReconcileOutcome> {
    tx.ensure_station(station_id).await?;

    let mut numbers: Vec<i64> = readings.iter().map(|r| r.port_number).collect();
    numbers.sort_unstable();
    numbers.dedup();

    let mut by_port: HashMap<i64, PortRecord> = tx
        .fetch_ports(station_id, &numbers)
        .await?
        .into_iter()
        .map(|record| (record.port_number, record))
        .collect();

    let mut outcome = ReconcileOutcome::default();
    for reading in readings {
        match by_port.get_mut(&reading.port_number) {
            Some(record) if reading.observed_at_ms < record.updated_at_ms => {
                outcome.skipped_stale += 1;
            }
            Some(record) => {
                record.apply(reading);
                tx.update_port(record).await?;
                outcome.updated += 1;
            }
            None => {
                let record = PortRecord::from_reading(station_id, reading);
                tx.insert_port(&record).await?;
                by_port.insert(record.port_number, record);
                outcome.inserted += 1;
            }
        }
    }
    Ok(outcome)
}
