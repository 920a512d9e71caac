//! # Storage Contract
//!
//! The narrow interface reconciliation needs from durable storage: a batched
//! read of a station's ports, row writes, and transactional commit/rollback.
//! Station administration lives here too because it shares the same tables.

use async_trait::async_trait;

use crate::errors::SyncResult;
use crate::stations::model::{PortRecord, Station};

/// One open write transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait PortTransaction: Send {
    /// Creates the station row if it does not exist yet. Takes the write lock.
    async fn ensure_station(&mut self, station_id: &str) -> SyncResult<()>;

    /// All existing rows of `station_id` among `port_numbers`, in a single read.
    async fn fetch_ports(&mut self, station_id: &str, port_numbers: &[i64]) -> SyncResult<Vec<PortRecord>>;

    async fn update_port(&mut self, record: &PortRecord) -> SyncResult<()>;

    async fn insert_port(&mut self, record: &PortRecord) -> SyncResult<()>;

    async fn commit(self: Box<Self>) -> SyncResult<()>;

    async fn rollback(self: Box<Self>) -> SyncResult<()>;
}

#[async_trait]
pub trait PortStore: Send + Sync {
    async fn begin(&self) -> SyncResult<Box<dyn PortTransaction>>;

    /// Inserts a station, or reactivates and renames an existing one.
    async fn upsert_station(&self, station_id: &str, name: &str) -> SyncResult<Station>;

    /// Soft delete. Returns false when the station does not exist.
    async fn deactivate_station(&self, station_id: &str) -> SyncResult<bool>;

    async fn get_station(&self, station_id: &str) -> SyncResult<Option<Station>>;

    async fn list_active_stations(&self) -> SyncResult<Vec<Station>>;

    /// Every port of a station ordered by port number.
    async fn ports_for_station(&self, station_id: &str) -> SyncResult<Vec<PortRecord>>;
}
