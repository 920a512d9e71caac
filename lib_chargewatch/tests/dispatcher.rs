mod common;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use lib_chargewatch::connections::db_sqlite::SqliteStore;
use lib_chargewatch::connections::store::PortStore;
use lib_chargewatch::core::{
    DispatcherConfig, FreshnessCache, Reconciler, RefreshDispatcher, RefreshOutcome, StationRefresher,
    StationService, TaskState,
};
use lib_chargewatch::stations::model::{FailureClass, FetchFailure, PortReading};
use lib_chargewatch::stations::StatusSource;
use lib_chargewatch::{PortStatus, SnapshotOrigin, StatusSnapshot, SyncError};

use common::memory_cache;

const WAIT: Duration = Duration::from_secs(5);

/// Replays a scripted sequence of origins per station, then answers from the vendor.
#[derive(Default)]
struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<SnapshotOrigin>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Mutex<Option<Duration>>,
    slow: Mutex<HashMap<String, Duration>>,
}

impl ScriptedSource {
    fn script(&self, station_id: &str, origins: Vec<SnapshotOrigin>) {
        self.scripts.lock().unwrap().insert(station_id.to_string(), origins.into());
    }

    /// Every fetch takes `delay` unless the station has its own.
    fn delay_all(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    fn delay_station(&self, station_id: &str, delay: Duration) {
        self.slow.lock().unwrap().insert(station_id.to_string(), delay);
    }

    fn calls(&self, station_id: &str) -> usize {
        self.calls.lock().unwrap().get(station_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl StatusSource for ScriptedSource {
    async fn fetch_status(&self, station_id: &str) -> StatusSnapshot {
        *self.calls.lock().unwrap().entry(station_id.to_string()).or_default() += 1;
        let delay = self
            .slow
            .lock()
            .unwrap()
            .get(station_id)
            .copied()
            .or(*self.delay.lock().unwrap());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let origin = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(station_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(SnapshotOrigin::Vendor);
        StatusSnapshot {
            station_id: station_id.to_string(),
            ports: vec![PortReading::from_occupancy(1, PortStatus::Occupied, "充电服务", 1)],
            origin,
            fetched_at_ms: 1,
        }
    }
}

fn fallback(class: FailureClass) -> SnapshotOrigin {
    SnapshotOrigin::Fallback(FetchFailure {
        class,
        reason: "scripted".into(),
    })
}

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        workers: 3,
        max_retries: 3,
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        chunk_size: 10,
        chunk_pause: Duration::from_millis(1),
        queue_capacity: 16,
        history_limit: 1024,
        task_timeout: Duration::from_secs(5),
        rate_per_minute: None,
    }
}

fn snapshot(station_id: &str) -> StatusSnapshot {
    StatusSnapshot {
        station_id: station_id.to_string(),
        ports: vec![PortReading::from_occupancy(1, PortStatus::Free, "充电服务", 1)],
        origin: SnapshotOrigin::Vendor,
        fetched_at_ms: 1,
    }
}

async fn setup_with(
    config: DispatcherConfig,
) -> (RefreshDispatcher, Arc<ScriptedSource>, Arc<SqliteStore>, Arc<FreshnessCache>) {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let source = Arc::new(ScriptedSource::default());
    let cache = memory_cache(Duration::from_secs(5));
    let refresher = Arc::new(StationRefresher::new(
        source.clone(),
        Arc::new(Reconciler::new(store.clone())),
        cache.clone(),
    ));
    let dispatcher = RefreshDispatcher::new(refresher, config);
    dispatcher.start();
    (dispatcher, source, store, cache)
}

async fn setup() -> (RefreshDispatcher, Arc<ScriptedSource>, Arc<SqliteStore>) {
    let (dispatcher, source, store, _) = setup_with(fast_config()).await;
    (dispatcher, source, store)
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let (dispatcher, source, store) = setup().await;
    source.script(
        "S",
        vec![fallback(FailureClass::TransientNetwork), fallback(FailureClass::TransientNetwork)],
    );

    let id = dispatcher.submit("S").await.unwrap();
    let record = dispatcher.wait_for(id, WAIT).await.unwrap();

    assert_eq!(record.state, TaskState::Succeeded);
    assert_eq!(record.attempts, 3);
    assert_eq!(source.calls("S"), 3);
    assert_eq!(store.ports_for_station("S").await.unwrap().len(), 1);
    dispatcher.stop().await;
}

#[tokio::test]
async fn business_failures_are_terminal_and_persist_nothing() {
    let (dispatcher, source, store) = setup().await;
    source.script("S", vec![fallback(FailureClass::VendorBusiness)]);

    let id = dispatcher.submit("S").await.unwrap();
    let record = dispatcher.wait_for(id, WAIT).await.unwrap();

    assert_eq!(record.state, TaskState::FailedTerminal);
    assert_eq!(record.attempts, 1);
    assert!(record.last_error.unwrap().contains("vendor business"));
    assert!(store.ports_for_station("S").await.unwrap().is_empty());
    dispatcher.stop().await;
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let (dispatcher, source, _) = setup().await;
    source.script("S", vec![fallback(FailureClass::TransientNetwork); 10]);

    let id = dispatcher.submit("S").await.unwrap();
    let record = dispatcher.wait_for(id, WAIT).await.unwrap();

    assert_eq!(record.state, TaskState::FailedTerminal);
    assert_eq!(record.attempts, 4);
    assert_eq!(source.calls("S"), 4);
    dispatcher.stop().await;
}

#[tokio::test]
async fn fleet_emits_one_task_per_station() {
    let (dispatcher, source, store) = setup().await;
    let stations: Vec<String> = (0..25).map(|i| format!("F{i:02}")).collect();
    source.script("F07", vec![fallback(FailureClass::VendorBusiness)]);

    let ids = dispatcher.submit_fleet(&stations).await.unwrap();
    assert_eq!(ids.len(), 25);

    let mut succeeded = 0;
    for id in ids {
        let record = dispatcher.wait_for(id, WAIT).await.unwrap();
        if record.state == TaskState::Succeeded {
            succeeded += 1;
        } else {
            assert_eq!(record.station_id, "F07");
        }
    }
    assert_eq!(succeeded, 24);
    assert!(store.ports_for_station("F07").await.unwrap().is_empty());
    assert_eq!(store.ports_for_station("F24").await.unwrap().len(), 1);
    dispatcher.stop().await;
}

#[tokio::test]
async fn cached_stations_are_refreshed_in_bulk() {
    let (dispatcher, source, _) = setup().await;
    for station in ["A", "B"] {
        let id = dispatcher.submit(station).await.unwrap();
        dispatcher.wait_for(id, WAIT).await.unwrap();
    }

    let ids = dispatcher.refresh_cached_stations().await.unwrap();
    assert_eq!(ids.len(), 2);
    for id in ids {
        assert_eq!(dispatcher.wait_for(id, WAIT).await.unwrap().state, TaskState::Succeeded);
    }
    assert_eq!(source.calls("A"), 2);
    assert_eq!(source.calls("B"), 2);
    dispatcher.stop().await;
}

#[tokio::test]
async fn stopped_dispatcher_refuses_work() {
    let (dispatcher, _, _) = setup().await;
    dispatcher.stop().await;
    assert!(matches!(dispatcher.submit("S").await, Err(SyncError::QueueClosed)));
}

#[tokio::test]
async fn service_queues_stale_stations_when_async_dispatch_is_on() {
    let store: Arc<dyn PortStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let source = Arc::new(ScriptedSource::default());
    let refresher = Arc::new(StationRefresher::new(
        source.clone(),
        Arc::new(Reconciler::new(store.clone())),
        memory_cache(Duration::from_secs(5)),
    ));
    let dispatcher = RefreshDispatcher::new(refresher.clone(), fast_config());
    dispatcher.start();
    let service = StationService::new(store.clone(), refresher, Some(dispatcher.clone()));

    let RefreshOutcome::Queued(id) = service.refresh_station("Q").await.unwrap() else {
        panic!("expected a queued task");
    };
    assert_eq!(dispatcher.wait_for(id, WAIT).await.unwrap().state, TaskState::Succeeded);
    assert!(matches!(service.refresh_station("Q").await.unwrap(), RefreshOutcome::Fresh));
    dispatcher.stop().await;
}

#[tokio::test]
async fn stop_is_bounded_when_the_queue_is_backed_up() {
    let config = DispatcherConfig {
        workers: 1,
        queue_capacity: 1,
        ..fast_config()
    };
    let (dispatcher, source, _, cache) = setup_with(config).await;
    source.delay_all(Duration::from_millis(200));
    for i in 0..6 {
        let station_id = format!("C{i}");
        cache.set(&station_id, &snapshot(&station_id)).await.unwrap();
    }

    let running = dispatcher.submit("A").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let queued = dispatcher.submit("B").await.unwrap();
    dispatcher.spawn_periodic_refresh(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    tokio::time::timeout(WAIT, dispatcher.stop())
        .await
        .expect("stop must not block on a full queue");
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(dispatcher.task(running).unwrap().state, TaskState::Succeeded);
    let leftover = dispatcher.task(queued).unwrap();
    assert_eq!(leftover.state, TaskState::FailedTerminal);
    assert_eq!(leftover.last_error.as_deref(), Some("abandoned at shutdown"));
    assert_eq!(source.calls("B"), 0);
    assert!(matches!(dispatcher.submit("D").await, Err(SyncError::QueueClosed)));
}

#[tokio::test]
async fn overrunning_attempts_time_out_as_transient_failures() {
    let config = DispatcherConfig {
        max_retries: 1,
        task_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let (dispatcher, source, store, _) = setup_with(config).await;
    source.delay_station("SLOW", Duration::from_millis(500));

    let slow = dispatcher.submit("SLOW").await.unwrap();
    let fast = dispatcher.submit("FAST").await.unwrap();

    let record = dispatcher.wait_for(slow, WAIT).await.unwrap();
    assert_eq!(record.state, TaskState::FailedTerminal);
    assert_eq!(record.attempts, 2);
    assert!(record.last_error.unwrap().contains("task exceeded 50 ms"));
    assert!(store.ports_for_station("SLOW").await.unwrap().is_empty());

    assert_eq!(dispatcher.wait_for(fast, WAIT).await.unwrap().state, TaskState::Succeeded);
    dispatcher.stop().await;
}

#[tokio::test]
async fn rate_limit_spaces_task_starts() {
    let config = DispatcherConfig {
        rate_per_minute: Some(600),
        ..fast_config()
    };
    let (dispatcher, _, _, _) = setup_with(config).await;

    let started = Instant::now();
    let mut ids = Vec::new();
    for station in ["R1", "R2", "R3"] {
        ids.push(dispatcher.submit(station).await.unwrap());
    }
    for id in ids {
        assert_eq!(dispatcher.wait_for(id, WAIT).await.unwrap().state, TaskState::Succeeded);
    }

    assert!(started.elapsed() >= Duration::from_millis(200));
    dispatcher.stop().await;
}
