use std::sync::Arc;
use std::time::Duration;

use lib_chargewatch::connections::{CacheBackend, MemoryBackend, PortStore, SqliteStore};
use lib_chargewatch::core::{
    DispatcherConfig, FreshnessCache, Reconciler, RefreshDispatcher, RefreshOutcome,
    StationRefresher, StationService,
};
use lib_chargewatch::stations::{StationClient, StatusSource};
use lib_chargewatch::SyncConfig;

/// Everything the worker process owns, wired from one `SyncConfig`.
pub struct Engine {
    pub service: StationService,
    pub dispatcher: RefreshDispatcher,
    pub client: Arc<StationClient>,
    pub store: SqliteStore,
}

async fn cache_backend(config: &SyncConfig) -> anyhow::Result<Arc<dyn CacheBackend>> {
    match &config.cache.redis_url {
        Some(url) => {
            let backend = lib_chargewatch::connections::RedisBackend::connect(url).await?;
            tracing::info!("freshness cache backed by redis");
            Ok(Arc::new(backend))
        }
        None => {
            tracing::info!("freshness cache backed by process memory");
            Ok(Arc::new(MemoryBackend::default()))
        }
    }
}

pub async fn build_engine(config: &SyncConfig) -> anyhow::Result<Engine> {
    let store = SqliteStore::connect(&config.database.url, config.database.max_connections).await?;
    store.ping().await?;

    let backend = cache_backend(config).await?;
    let cache = Arc::new(FreshnessCache::new(backend, &config.cache));

    let client = Arc::new(StationClient::new(&config.vendor, config.synthetic.clone())?);
    let source: Arc<dyn StatusSource> = client.clone();

    let port_store: Arc<dyn PortStore> = Arc::new(store.clone());
    let reconciler = Arc::new(Reconciler::new(port_store.clone()));
    let refresher = Arc::new(StationRefresher::new(source, reconciler, cache));

    let dispatcher = RefreshDispatcher::new(refresher.clone(), DispatcherConfig::from(&config.tasks));
    let queued = config.tasks.async_dispatch.then(|| dispatcher.clone());
    let service = StationService::new(port_store, refresher, queued);

    Ok(Engine {
        service,
        dispatcher,
        client,
        store,
    })
}

/// One pass over every active station, logged per station.
pub async fn refresh_cycle(engine: &Engine) -> anyhow::Result<()> {
    let results = engine.service.refresh_all_active().await?;
    let mut failed = 0usize;
    for (station_id, result) in &results {
        match result {
            Ok(RefreshOutcome::Fresh) => tracing::debug!(station_id, "cache fresh"),
            Ok(RefreshOutcome::Refreshed(report)) => tracing::info!(
                station_id,
                origin = ?report.origin(),
                inserted = report.outcome.inserted,
                updated = report.outcome.updated,
                "station refreshed"
            ),
            Ok(RefreshOutcome::Queued(task_id)) => tracing::debug!(station_id, %task_id, "refresh queued"),
            Err(e) => {
                failed += 1;
                tracing::warn!(station_id, error = %e, "station refresh failed");
            }
        }
    }
    let stats = engine.client.stats();
    tracing::info!(
        stations = results.len(),
        failed,
        live = stats.live,
        forced_synthetic = stats.forced_synthetic,
        fallback_transient = stats.fallback_transient,
        fallback_business = stats.fallback_business,
        "refresh cycle complete"
    );
    Ok(())
}

/// Starts the worker pool and the periodic bulk refresh when async dispatch is on.
/// Returns whether anything was started.
pub fn start_dispatch(engine: &Engine, config: &SyncConfig, interval: Duration) -> bool {
    if !config.tasks.async_dispatch {
        tracing::info!("async dispatch disabled, refreshing inline only");
        return false;
    }
    engine.dispatcher.start();
    engine.dispatcher.spawn_periodic_refresh(interval);
    true
}

/// Runs until `shutdown` resolves, then drains the dispatcher.
pub async fn run<F>(config: SyncConfig, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()>,
{
    let engine = build_engine(&config).await?;

    let station = engine.service.default_station().await?;
    tracing::info!(station_id = %station.id, name = %station.name, "default station ready");

    let interval = Duration::from_secs(config.tasks.refresh_interval_secs.max(1));
    let dispatching = start_dispatch(&engine, &config, interval);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = refresh_cycle(&engine).await {
                    tracing::error!(error = %e, "refresh cycle aborted");
                }
            }
        }
    }

    if dispatching {
        engine.dispatcher.stop().await;
    }
    engine.store.pool.close().await;
    Ok(())
}
