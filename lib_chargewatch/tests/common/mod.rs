#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use lib_chargewatch::configs::config_sync::VendorConfig;
use lib_chargewatch::connections::cache_backend::MemoryBackend;
use lib_chargewatch::connections::store::{PortStore, PortTransaction};
use lib_chargewatch::connections::db_sqlite::SqliteStore;
use lib_chargewatch::core::FreshnessCache;
use lib_chargewatch::stations::model::{PortRecord, Station};
use lib_chargewatch::SyncResult;

pub fn http_ok(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

/// A local vendor endpoint answering every request with `response`.
pub async fn mock_vendor(response: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock vendor");
    let url = format!("http://{}/device/detail", listener.local_addr().expect("addr"));
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.flush().await;
        }
    });
    url
}

/// A local endpoint that accepts connections and never answers.
pub async fn stalled_vendor() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stalled vendor");
    let url = format!("http://{}/device/detail", listener.local_addr().expect("addr"));
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    url
}

pub fn vendor_config(endpoint: &str) -> VendorConfig {
    VendorConfig {
        endpoint: endpoint.to_string(),
        secret_key: Some("secret".into()),
        token: Some("AppletUser:test".into()),
        connect_timeout_ms: 300,
        read_timeout_ms: 300,
        max_http_retries: 0,
        retry_min_backoff_ms: 1,
        retry_max_backoff_ms: 2,
        ..VendorConfig::default()
    }
}

pub fn memory_cache(ttl: Duration) -> Arc<FreshnessCache> {
    Arc::new(FreshnessCache::with_ttl(Arc::new(MemoryBackend::new()), "charging_station:", ttl))
}

#[derive(Default)]
pub struct Counters {
    pub begins: AtomicUsize,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Wraps a store and counts transaction round trips.
pub struct CountingStore {
    pub inner: SqliteStore,
    pub counters: Arc<Counters>,
    /// Fail the n-th write (1-based) of the whole run, if set.
    pub fail_on_write: Option<usize>,
}

impl CountingStore {
    pub async fn new() -> Self {
        Self {
            inner: SqliteStore::in_memory().await.expect("in-memory store"),
            counters: Arc::new(Counters::default()),
            fail_on_write: None,
        }
    }
}

struct CountingTx {
    inner: Box<dyn PortTransaction>,
    counters: Arc<Counters>,
    fail_on_write: Option<usize>,
}

impl CountingTx {
    fn write_allowed(&self) -> SyncResult<()> {
        let n = self.counters.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_write == Some(n) {
            return Err(lib_chargewatch::SyncError::Storage("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PortTransaction for CountingTx {
    async fn ensure_station(&mut self, station_id: &str) -> SyncResult<()> {
        self.inner.ensure_station(station_id).await
    }

    async fn fetch_ports(&mut self, station_id: &str, port_numbers: &[i64]) -> SyncResult<Vec<PortRecord>> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_ports(station_id, port_numbers).await
    }

    async fn update_port(&mut self, record: &PortRecord) -> SyncResult<()> {
        self.write_allowed()?;
        self.inner.update_port(record).await
    }

    async fn insert_port(&mut self, record: &PortRecord) -> SyncResult<()> {
        self.write_allowed()?;
        self.inner.insert_port(record).await
    }

    async fn commit(self: Box<Self>) -> SyncResult<()> {
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> SyncResult<()> {
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback().await
    }
}

#[async_trait]
impl PortStore for CountingStore {
    async fn begin(&self) -> SyncResult<Box<dyn PortTransaction>> {
        self.counters.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingTx {
            inner: self.inner.begin().await?,
            counters: self.counters.clone(),
            fail_on_write: self.fail_on_write,
        }))
    }

    async fn upsert_station(&self, station_id: &str, name: &str) -> SyncResult<Station> {
        self.inner.upsert_station(station_id, name).await
    }

    async fn deactivate_station(&self, station_id: &str) -> SyncResult<bool> {
        self.inner.deactivate_station(station_id).await
    }

    async fn get_station(&self, station_id: &str) -> SyncResult<Option<Station>> {
        self.inner.get_station(station_id).await
    }

    async fn list_active_stations(&self) -> SyncResult<Vec<Station>> {
        self.inner.list_active_stations().await
    }

    async fn ports_for_station(&self, station_id: &str) -> SyncResult<Vec<PortRecord>> {
        self.inner.ports_for_station(station_id).await
    }
}
