use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use lib_chargewatch::SyncConfig;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Charging station status synchronization worker", version)]
#[serde(rename_all = "camelCase")]
pub struct Cli {
    #[clap(long, env = "SYNC_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SYNC_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, help = "Emit console logs as JSON.")]
    pub log_json: Option<bool>,

    #[clap(long, help = "SQLite database URL.")]
    pub database_url: Option<String>,

    #[clap(long, help = "Redis URL for the shared freshness cache.")]
    pub redis_url: Option<String>,

    #[clap(long, help = "Serve synthetic snapshots without calling the vendor.")]
    pub force_synthetic: Option<bool>,

    #[clap(long, help = "Queue refreshes through the dispatcher instead of running them inline.")]
    pub async_dispatch: Option<bool>,

    #[clap(long, help = "Number of dispatcher workers.")]
    pub workers: Option<usize>,

    #[clap(long, help = "Seconds between periodic refresh cycles.")]
    pub refresh_interval_secs: Option<u64>,

    #[clap(long, help = "Cache TTL in seconds.")]
    pub cache_ttl_secs: Option<u64>,
}

impl Cli {
    /// Flags that were given override the loaded configuration.
    pub fn merge_into(self, mut config: SyncConfig) -> SyncConfig {
        if let Some(dir) = self.log_dir {
            config.logging.log_dir = Some(dir);
        }
        config.logging.level = self.log_level.unwrap_or(config.logging.level);
        config.logging.json = self.log_json.unwrap_or(config.logging.json);
        config.database.url = self.database_url.unwrap_or(config.database.url);
        config.cache.redis_url = self.redis_url.or(config.cache.redis_url);
        config.vendor.force_synthetic = self.force_synthetic.unwrap_or(config.vendor.force_synthetic);
        config.tasks.async_dispatch = self.async_dispatch.unwrap_or(config.tasks.async_dispatch);
        config.tasks.workers = self.workers.unwrap_or(config.tasks.workers);
        config.tasks.refresh_interval_secs = self.refresh_interval_secs.unwrap_or(config.tasks.refresh_interval_secs);
        config.cache.ttl_secs = self.cache_ttl_secs.unwrap_or(config.cache.ttl_secs);
        config
    }
}

/// Defaults, then the config file, then `.env` and the environment, then CLI flags.
pub fn load_config(cli: Cli) -> anyhow::Result<SyncConfig> {
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_sync.conf"));
    let config = SyncConfig::load(Some(&path))?;
    let config = cli.merge_into(config);
    config.validate()?;
    Ok(config)
}
