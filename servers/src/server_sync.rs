//! Station-status synchronization worker.
//!
//! Provisions the default station, then refreshes every active station on a
//! fixed interval until SIGINT or SIGTERM.

use anyhow::Result;
use clap::Parser;
use tokio::signal;

mod sync_logic;
use sync_logic::{config, runtime};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let config = config::load_config(cli)?;
    let _guard = lib_chargewatch::loggers::init_tracing("server_sync", &config.logging)?;

    tracing::info!(
        force_synthetic = config.vendor.force_synthetic,
        async_dispatch = config.tasks.async_dispatch,
        workers = config.tasks.workers,
        "server_sync starting"
    );

    runtime::run(config, shutdown_signal()).await?;

    tracing::info!("server_sync stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    // Never completes off unix.
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
