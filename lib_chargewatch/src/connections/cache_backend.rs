//! # Cache Backends
//!
//! A key/value contract small enough for any shared store to satisfy, and an
//! in-process implementation for single-node use and tests. Values are opaque
//! strings; freshness is judged by the caller, not the backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::SyncResult;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> SyncResult<Option<String>>;

    /// Stores `value`, replacing any previous one. `retention` is a hint for native expiry.
    async fn set(&self, key: &str, value: String, retention: Option<Duration>) -> SyncResult<()>;

    async fn delete(&self, key: &str) -> SyncResult<()>;

    /// Every stored key starting with `prefix`, in no particular order.
    async fn scan_keys(&self, prefix: &str) -> SyncResult<Vec<String>>;
}

/// In-process backend. Entries live until deleted or the process exits.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String, _retention: Option<Duration>) -> SyncResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn scan_keys(&self, prefix: &str) -> SyncResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
