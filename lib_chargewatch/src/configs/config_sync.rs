//! # Synchronization Configuration
//!
//! `SyncConfig` is assembled in layers: built-in defaults, an optional JSON
//! file, then `.env` and the process environment. The binary adds CLI flags on
//! top. `validate` is called once at startup so that missing credentials fail
//! fast instead of on the first fetch.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{SyncError, SyncResult};

pub const DEFAULT_ENDPOINT: &str = "https://app.mamcharge.com/device/detail";
pub const DEFAULT_SERVICE_LABEL: &str = "充电服务";
pub const DEFAULT_STATION_ID: &str = "9313600954";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub vendor: VendorConfig,
    pub cache: CacheConfig,
    pub tasks: TaskConfig,
    pub synthetic: SyntheticConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Credentials and network budgets for the vendor status endpoint.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorConfig {
    pub endpoint: String,
    pub secret_key: Option<String>,
    pub app_id: String,
    pub app_comm_id: String,
    pub token: Option<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_http_retries: u32,
    pub retry_min_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub pool_max_idle_per_host: usize,
    /// Relaxes TLS certificate validation for the vendor endpoint. Off unless set explicitly.
    pub accept_invalid_certs: bool,
    /// Skips the network entirely and serves synthetic snapshots (offline/dev operation).
    pub force_synthetic: bool,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            secret_key: None,
            app_id: "mengma".to_string(),
            app_comm_id: "MCB_INSTANCE_WECHAT_APP".to_string(),
            token: None,
            connect_timeout_ms: 3_000,
            read_timeout_ms: 5_000,
            max_http_retries: 3,
            retry_min_backoff_ms: 500,
            retry_max_backoff_ms: 4_000,
            pool_max_idle_per_host: 10,
            accept_invalid_certs: false,
            force_synthetic: false,
        }
    }
}

// Secrets stay out of debug output.
impl std::fmt::Debug for VendorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorConfig")
            .field("endpoint", &self.endpoint)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("app_id", &self.app_id)
            .field("app_comm_id", &self.app_comm_id)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("max_http_retries", &self.max_http_retries)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("force_synthetic", &self.force_synthetic)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub key_prefix: String,
    /// When unset the in-process backend is used.
    pub redis_url: Option<String>,
    /// Native key expiry on shared backends. Validity is always judged against `ttl_secs`.
    pub retention_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 5,
            key_prefix: "charging_station:".to_string(),
            redis_url: None,
            retention_secs: 3_600,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub async_dispatch: bool,
    pub workers: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub chunk_size: usize,
    pub chunk_pause_ms: u64,
    pub queue_capacity: usize,
    pub refresh_interval_secs: u64,
    /// Upper bound on a single task attempt.
    pub task_timeout_ms: u64,
    /// Task starts per minute across all workers; 0 disables the limit.
    pub rate_limit_per_minute: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            async_dispatch: false,
            workers: 4,
            max_retries: 3,
            retry_base_delay_ms: 10_000,
            retry_max_delay_ms: 600_000,
            chunk_size: 10,
            chunk_pause_ms: 0,
            queue_capacity: 1_024,
            refresh_interval_secs: 60,
            task_timeout_ms: 300_000,
            rate_limit_per_minute: 0,
        }
    }
}

/// Port layout used when a snapshot has to be synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationProfile {
    pub port_count: u32,
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub default_port_count: u32,
    pub default_service: String,
    /// Keyed by full station id or by a 2-character id prefix.
    pub profiles: BTreeMap<String, StationProfile>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            DEFAULT_STATION_ID.to_string(),
            StationProfile {
                port_count: 4,
                service: DEFAULT_SERVICE_LABEL.to_string(),
            },
        );
        Self {
            default_port_count: 4,
            default_service: DEFAULT_SERVICE_LABEL.to_string(),
            profiles,
        }
    }
}

impl SyntheticConfig {
    /// Resolves a station's profile: exact id, then 2-character prefix, then the defaults.
    pub fn profile_for(&self, station_id: &str) -> StationProfile {
        if let Some(profile) = self.profiles.get(station_id) {
            return profile.clone();
        }
        let prefix: String = station_id.chars().take(2).collect();
        if prefix.chars().count() == 2 {
            if let Some(profile) = self.profiles.get(&prefix) {
                return profile.clone();
            }
        }
        StationProfile {
            port_count: self.default_port_count,
            service: self.default_service.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://chargewatch.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub log_dir: Option<PathBuf>,
    pub keep_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_dir: None,
            keep_files: 5,
        }
    }
}

impl SyncConfig {
    /// Reads a JSON config file. Missing sections fall back to defaults.
    pub fn from_file(path: &Path) -> SyncResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            SyncError::Config(format!("cannot parse config file {}: {}", path.display(), e))
        })
    }

    /// Defaults, then the optional file, then `.env` and the environment.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            Some(p) => {
                tracing::info!(path = %p.display(), "config file not found, using defaults and environment");
                Self::default()
            }
            None => Self::default(),
        };

        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to load .env file");
            }
        }
        config.apply_env_with(|name| env::var(name).ok())?;
        Ok(config)
    }

    /// Applies overrides from a variable lookup. Split out from `load` so tests don't touch the process env.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> SyncResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("API_SECRET_KEY") {
            self.vendor.secret_key = Some(v);
        }
        if let Some(v) = lookup("API_APPID") {
            self.vendor.app_id = v;
        }
        if let Some(v) = lookup("API_APPCOMMID") {
            self.vendor.app_comm_id = v;
        }
        if let Some(v) = lookup("API_TOKEN") {
            self.vendor.token = Some(v);
        }
        if let Some(v) = lookup("REDIS_URL") {
            self.cache.redis_url = Some(v);
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        override_parsed(&lookup, "CACHE_TIMEOUT", &mut self.cache.ttl_secs)?;
        override_parsed(&lookup, "WORKER_CONCURRENCY", &mut self.tasks.workers)?;
        override_parsed(&lookup, "BATCH_UPDATE_SIZE", &mut self.tasks.chunk_size)?;
        override_parsed(&lookup, "TASK_MAX_RETRIES", &mut self.tasks.max_retries)?;
        override_parsed(&lookup, "TASK_TIMEOUT_MS", &mut self.tasks.task_timeout_ms)?;
        override_parsed(&lookup, "TASK_RATE_LIMIT", &mut self.tasks.rate_limit_per_minute)?;
        override_flag(&lookup, "FORCE_SYNTHETIC", &mut self.vendor.force_synthetic)?;
        override_flag(&lookup, "ASYNC_DISPATCH", &mut self.tasks.async_dispatch)?;
        Ok(())
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if !self.vendor.force_synthetic {
            if self.vendor.secret_key.as_deref().map_or(true, str::is_empty) {
                return Err(SyncError::Config("vendor secret key is required".into()));
            }
            if self.vendor.token.as_deref().map_or(true, str::is_empty) {
                return Err(SyncError::Config("vendor token is required".into()));
            }
        }
        if self.cache.ttl_secs == 0 {
            return Err(SyncError::Config("cache ttl must be positive".into()));
        }
        if self.tasks.workers == 0 {
            return Err(SyncError::Config("worker count must be positive".into()));
        }
        if self.tasks.chunk_size == 0 {
            return Err(SyncError::Config("chunk size must be positive".into()));
        }
        if self.tasks.task_timeout_ms == 0 {
            return Err(SyncError::Config("task timeout must be positive".into()));
        }
        if self.tasks.queue_capacity == 0 {
            return Err(SyncError::Config("queue capacity must be positive".into()));
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T) -> SyncResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| SyncError::Config(format!("{name} has an invalid value: {raw}")))?;
    }
    Ok(())
}

fn override_flag<F>(lookup: &F, name: &str, target: &mut bool) -> SyncResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *target = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => return Err(SyncError::Config(format!("{name} is not a boolean: {raw}"))),
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_original_operating_values() {
        let config = SyncConfig::default();
        assert_eq!(config.cache.ttl_secs, 5);
        assert_eq!(config.vendor.connect_timeout_ms, 3_000);
        assert_eq!(config.vendor.read_timeout_ms, 5_000);
        assert_eq!(config.tasks.max_retries, 3);
        assert!(!config.vendor.accept_invalid_certs);
        assert!(!config.tasks.async_dispatch);
    }

    #[test]
    fn environment_overrides_are_applied() {
        let mut config = SyncConfig::default();
        config
            .apply_env_with(lookup_from(&[
                ("API_SECRET_KEY", "s3cret"),
                ("API_TOKEN", "AppletUser:abc"),
                ("CACHE_TIMEOUT", "30"),
                ("ASYNC_DISPATCH", "true"),
                ("BATCH_UPDATE_SIZE", "25"),
                ("TASK_TIMEOUT_MS", "45000"),
                ("TASK_RATE_LIMIT", "5"),
            ]))
            .expect("overrides should parse");

        assert_eq!(config.vendor.secret_key.as_deref(), Some("s3cret"));
        assert_eq!(config.vendor.token.as_deref(), Some("AppletUser:abc"));
        assert_eq!(config.cache.ttl_secs, 30);
        assert!(config.tasks.async_dispatch);
        assert_eq!(config.tasks.chunk_size, 25);
        assert_eq!(config.tasks.task_timeout_ms, 45_000);
        assert_eq!(config.tasks.rate_limit_per_minute, 5);
    }

    #[test]
    fn malformed_numeric_override_is_a_config_error() {
        let mut config = SyncConfig::default();
        let result = config.apply_env_with(lookup_from(&[("CACHE_TIMEOUT", "soon")]));
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn missing_credentials_fail_validation_unless_synthetic() {
        let mut config = SyncConfig::default();
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        config.vendor.force_synthetic = true;
        assert!(config.validate().is_ok());

        config.vendor.force_synthetic = false;
        config.vendor.secret_key = Some("key".into());
        config.vendor.token = Some("token".into());
        assert!(config.validate().is_ok());

        config.tasks.chunk_size = 0;
        assert!(config.validate().is_err());

        config.tasks.chunk_size = 10;
        config.tasks.task_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn profile_lookup_prefers_exact_then_prefix_then_default() {
        let mut synthetic = SyntheticConfig::default();
        synthetic.profiles.insert(
            "88".into(),
            StationProfile { port_count: 10, service: "快充".into() },
        );

        assert_eq!(synthetic.profile_for(DEFAULT_STATION_ID).port_count, 4);
        assert_eq!(synthetic.profile_for("8812345678").port_count, 10);
        assert_eq!(synthetic.profile_for("8812345678").service, "快充");
        assert_eq!(synthetic.profile_for("7700000000").port_count, 4);
        assert_eq!(synthetic.profile_for("8").port_count, 4);
    }

    #[test]
    fn partial_config_file_keeps_defaults_for_missing_sections() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "cache": {{ "ttl_secs": 12 }}, "tasks": {{ "workers": 2 }} }}"#)
            .expect("write config");

        let config = SyncConfig::from_file(file.path()).expect("config should parse");
        assert_eq!(config.cache.ttl_secs, 12);
        assert_eq!(config.cache.key_prefix, "charging_station:");
        assert_eq!(config.tasks.workers, 2);
        assert_eq!(config.tasks.max_retries, 3);
        assert_eq!(config.vendor.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut config = SyncConfig::default();
        config.vendor.secret_key = Some("top-secret".into());
        let rendered = format!("{:?}", config.vendor);
        assert!(!rendered.contains("top-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
