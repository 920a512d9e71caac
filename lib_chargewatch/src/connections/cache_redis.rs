//! # Redis Cache Backend
//!
//! Shared cache for deployments with more than one worker process. Keys get a
//! native expiry of `retention` so abandoned stations do not accumulate.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::connections::cache_backend::CacheBackend;
use crate::errors::SyncResult;

const SCAN_BATCH: usize = 200;

/// A handler for Redis cache interactions over a reconnecting multiplexed connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connects to `url` (e.g. "redis://127.0.0.1/").
    pub async fn connect(url: &str) -> SyncResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!("connected to redis cache backend");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, retention: Option<Duration>) -> SyncResult<()> {
        let mut conn = self.conn.clone();
        match retention.map(|d| d.as_secs().max(1)) {
            Some(secs) => {
                let _: () = conn.set_ex(key, value, secs).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn scan_keys(&self, prefix: &str) -> SyncResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
