//! # SQLite Store
//!
//! A managed `sqlx` pool over SQLite implementing [`PortStore`]. The schema is
//! created on connect. Transactions start with a write so that concurrent
//! writers queue on SQLite's lock instead of failing on upgrade.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};

use crate::connections::store::{PortStore, PortTransaction};
use crate::errors::{SyncError, SyncResult};
use crate::stations::model::{now_unix_ms, PortRecord, PortStatus, Station};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS charging_stations (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS port_status (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        station_id TEXT NOT NULL REFERENCES charging_stations(id),
        port_number INTEGER NOT NULL,
        status TEXT NOT NULL,
        service TEXT NOT NULL,
        voltage REAL NOT NULL,
        current REAL NOT NULL,
        updated_at_ms INTEGER NOT NULL,
        UNIQUE (station_id, port_number)
    )",
    "CREATE INDEX IF NOT EXISTS idx_port_status_station ON port_status (station_id)",
];

const PORT_COLUMNS: &str = "station_id, port_number, status, service, voltage, current, updated_at_ms";

/// A wrapper around the SQLite connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    /// The underlying sqlx connection pool.
    pub pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `database_url` and applies the schema.
    pub async fn connect(database_url: &str, max_connections: u32) -> SyncResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| SyncError::Config(format!("invalid database url {database_url}: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory database. One connection, kept for the pool's lifetime.
    pub async fn in_memory() -> SyncResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> SyncResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Checks the health of the database connection by running a simple query.
    pub async fn ping(&self) -> SyncResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl PortTransaction for SqliteTransaction {
    async fn ensure_station(&mut self, station_id: &str) -> SyncResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO charging_stations (id, name, is_active, created_at_ms) VALUES (?, ?, 1, ?)",
        )
        .bind(station_id)
        .bind(format!("充电桩 {station_id}"))
        .bind(now_unix_ms())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn fetch_ports(&mut self, station_id: &str, port_numbers: &[i64]) -> SyncResult<Vec<PortRecord>> {
        if port_numbers.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {PORT_COLUMNS} FROM port_status WHERE station_id = "));
        qb.push_bind(station_id);
        qb.push(" AND port_number IN (");
        let mut list = qb.separated(", ");
        for number in port_numbers {
            list.push_bind(*number);
        }
        list.push_unseparated(")");

        let rows = qb.build().fetch_all(&mut *self.tx).await?;
        rows.iter().map(port_from_row).collect()
    }

    async fn update_port(&mut self, record: &PortRecord) -> SyncResult<()> {
        let result = sqlx::query(
            "UPDATE port_status SET status = ?, service = ?, voltage = ?, current = ?, updated_at_ms = ?
             WHERE station_id = ? AND port_number = ?",
        )
        .bind(record.status.as_str())
        .bind(&record.service)
        .bind(record.voltage)
        .bind(record.current)
        .bind(record.updated_at_ms)
        .bind(&record.station_id)
        .bind(record.port_number)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(SyncError::Storage(format!(
                "port {} of station {} vanished during update",
                record.port_number, record.station_id
            )));
        }
        Ok(())
    }

    async fn insert_port(&mut self, record: &PortRecord) -> SyncResult<()> {
        sqlx::query(&format!("INSERT INTO port_status ({PORT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"))
            .bind(&record.station_id)
            .bind(record.port_number)
            .bind(record.status.as_str())
            .bind(&record.service)
            .bind(record.voltage)
            .bind(record.current)
            .bind(record.updated_at_ms)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> SyncResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> SyncResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl PortStore for SqliteStore {
    async fn begin(&self) -> SyncResult<Box<dyn PortTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn upsert_station(&self, station_id: &str, name: &str) -> SyncResult<Station> {
        sqlx::query(
            "INSERT INTO charging_stations (id, name, is_active, created_at_ms) VALUES (?, ?, 1, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, is_active = 1",
        )
        .bind(station_id)
        .bind(name)
        .bind(now_unix_ms())
        .execute(&self.pool)
        .await?;

        self.get_station(station_id)
            .await?
            .ok_or_else(|| SyncError::Storage(format!("station {station_id} missing after upsert")))
    }

    async fn deactivate_station(&self, station_id: &str) -> SyncResult<bool> {
        let result = sqlx::query("UPDATE charging_stations SET is_active = 0 WHERE id = ?")
            .bind(station_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_station(&self, station_id: &str) -> SyncResult<Option<Station>> {
        let row = sqlx::query("SELECT id, name, is_active, created_at_ms FROM charging_stations WHERE id = ?")
            .bind(station_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(station_from_row).transpose()
    }

    async fn list_active_stations(&self) -> SyncResult<Vec<Station>> {
        let rows = sqlx::query(
            "SELECT id, name, is_active, created_at_ms FROM charging_stations WHERE is_active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(station_from_row).collect()
    }

    async fn ports_for_station(&self, station_id: &str) -> SyncResult<Vec<PortRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PORT_COLUMNS} FROM port_status WHERE station_id = ? ORDER BY port_number"
        ))
        .bind(station_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(port_from_row).collect()
    }
}

fn station_from_row(row: &SqliteRow) -> SyncResult<Station> {
    Ok(Station {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

fn port_from_row(row: &SqliteRow) -> SyncResult<PortRecord> {
    let status: String = row.try_get("status")?;
    Ok(PortRecord {
        station_id: row.try_get("station_id")?,
        port_number: row.try_get("port_number")?,
        status: PortStatus::parse_str(&status)
            .ok_or_else(|| SyncError::Storage(format!("unknown port status {status}")))?,
        service: row.try_get("service")?,
        voltage: row.try_get("voltage")?,
        current: row.try_get("current")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}
