use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::configs::config_sync::LoggingConfig;
use crate::errors::{SyncError, SyncResult};

/// Keeps the non-blocking file writer alive. Dropping it flushes buffered lines.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// # Setup Logging
///
/// Builds the subscriber from `LoggingConfig`:
/// - `RUST_LOG` wins over the configured level.
/// - Console output is human-readable, or JSON when `json` is set.
/// - With a `log_dir`, a daily file named after `app_name` receives JSON lines.
///   Files beyond `keep_files` are deleted first.
pub fn init_tracing(app_name: &str, config: &LoggingConfig) -> SyncResult<LoggingGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| SyncError::Config(format!("invalid log level {}: {}", config.level, e)))?;

    let console_layer = if config.json {
        fmt::layer().with_target(true).json().boxed()
    } else {
        fmt::layer().with_target(true).with_ansi(true).boxed()
    };

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(|e| {
                SyncError::Config(format!("cannot create log dir {}: {}", dir.display(), e))
            })?;
            let removed = prune_old_logs(app_name, dir, config.keep_files);
            let (writer, guard) = non_blocking(rolling::daily(dir, app_name));
            let layer = fmt::layer().with_ansi(false).with_writer(writer).json().boxed();
            if !removed.is_empty() {
                eprintln!("removed {} old log file(s) from {}", removed.len(), dir.display());
            }
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SyncError::Config(format!("tracing already initialized: {e}")))?;

    tracing::info!(level = %config.level, json = config.json, "logging initialized");
    Ok(LoggingGuard { _file_guard: file_guard })
}

/// Deletes the oldest `<app_name>.*` files in `dir` so that at most `keep` remain.
///
/// Daily file names end in the date, so lexical order is age order. Returns the removed paths.
pub fn prune_old_logs(app_name: &str, dir: &Path, keep: usize) -> Vec<PathBuf> {
    let prefix = format!("{app_name}.");
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect(),
        Err(_) => return Vec::new(),
    };

    // newest first
    files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = Vec::new();
    for old in files.into_iter().skip(keep) {
        match fs::remove_file(&old) {
            Ok(()) => removed.push(old),
            Err(e) => eprintln!("Error deleting old log file {}: {}", old.display(), e),
        }
    }
    removed
}
