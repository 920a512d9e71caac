//! # Freshness Cache
//!
//! The last snapshot per station, stamped with its capture time. An entry is
//! served only while `now - captured_at < ttl`; older entries stay in the
//! backend so bulk refresh can still enumerate them. The cache is an
//! accelerator: storage remains the system of record.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::configs::config_sync::CacheConfig;
use crate::connections::cache_backend::CacheBackend;
use crate::errors::SyncResult;
use crate::stations::model::{now_unix_ms, StatusSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEnvelope {
    captured_at_ms: i64,
    data: StatusSnapshot,
}

/// A cached snapshot together with its age check.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub snapshot: StatusSnapshot,
    pub captured_at_ms: i64,
    pub fresh: bool,
}

pub struct FreshnessCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    key_prefix: String,
    retention: Option<Duration>,
}

impl FreshnessCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            ttl: config.ttl(),
            key_prefix: config.key_prefix.clone(),
            retention: Some(Duration::from_secs(config.retention_secs.max(config.ttl_secs))),
        }
    }

    /// A cache with an explicit TTL and no native expiry.
    pub fn with_ttl(backend: Arc<dyn CacheBackend>, key_prefix: &str, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            key_prefix: key_prefix.to_string(),
            retention: None,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn station_prefix(&self) -> String {
        format!("{}station:", self.key_prefix)
    }

    pub fn key_for(&self, station_id: &str) -> String {
        format!("{}station:{}", self.key_prefix, station_id)
    }

    /// The snapshot for `station_id` if one exists and is still within the TTL.
    pub async fn get(&self, station_id: &str) -> SyncResult<Option<StatusSnapshot>> {
        Ok(self
            .get_entry(station_id)
            .await?
            .filter(|entry| entry.fresh)
            .map(|entry| entry.snapshot))
    }

    /// The stored entry regardless of age. Unreadable entries count as absent.
    pub async fn get_entry(&self, station_id: &str) -> SyncResult<Option<CacheEntry>> {
        let Some(raw) = self.backend.get(&self.key_for(station_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<CacheEnvelope>(&raw) {
            Ok(envelope) => {
                let age_ms = now_unix_ms().saturating_sub(envelope.captured_at_ms);
                let fresh = i128::from(age_ms) < self.ttl.as_millis() as i128;
                Ok(Some(CacheEntry {
                    snapshot: envelope.data,
                    captured_at_ms: envelope.captured_at_ms,
                    fresh,
                }))
            }
            Err(e) => {
                tracing::warn!(station_id, error = %e, "discarding unreadable cache entry");
                Ok(None)
            }
        }
    }

    pub async fn is_fresh(&self, station_id: &str) -> SyncResult<bool> {
        Ok(self.get_entry(station_id).await?.is_some_and(|entry| entry.fresh))
    }

    /// Stores `snapshot` stamped with the current time, replacing any previous entry.
    pub async fn set(&self, station_id: &str, snapshot: &StatusSnapshot) -> SyncResult<()> {
        let envelope = CacheEnvelope {
            captured_at_ms: now_unix_ms(),
            data: snapshot.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;
        self.backend
            .set(&self.key_for(station_id), payload, self.retention)
            .await?;
        tracing::debug!(station_id, ports = snapshot.ports.len(), "cached snapshot");
        Ok(())
    }

    pub async fn invalidate(&self, station_id: &str) -> SyncResult<()> {
        self.backend.delete(&self.key_for(station_id)).await
    }

    /// Removes every entry under this cache's prefix. Returns how many were removed.
    pub async fn invalidate_all(&self) -> SyncResult<usize> {
        let keys = self.backend.scan_keys(&self.station_prefix()).await?;
        for key in &keys {
            self.backend.delete(key).await?;
        }
        tracing::info!(removed = keys.len(), "invalidated all cached snapshots");
        Ok(keys.len())
    }

    /// Ids of every station with an entry, fresh or not, sorted.
    pub async fn list_cached_station_ids(&self) -> SyncResult<Vec<String>> {
        let prefix = self.station_prefix();
        let mut ids: Vec<String> = self
            .backend
            .scan_keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .filter(|id| !id.is_empty())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
