//! # Refresh Dispatcher
//!
//! Asynchronous refresh work for stations. An explicitly constructed object
//! with its own lifecycle: `start` spawns a fixed pool of workers consuming a
//! bounded queue, `stop` cancels them and closes the queue.
//!
//! ## Task lifecycle
//!
//! `Pending -> Running -> Succeeded | FailedRetryable | FailedTerminal`.
//! A retryable failure waits `min(base * 2^retries, max)` on a timer and goes
//! back to `Pending`; only [`SyncError::is_retryable`] failures qualify, and
//! only until `max_retries` is spent. Tasks are idempotent, so running one
//! twice for the same station just repeats fetch, reconcile and cache.
//!
//! Each attempt runs under `task_timeout`; an attempt that overruns counts as
//! a transient failure. With `rate_per_minute` set, task starts across all
//! workers are spaced evenly at that rate.
//!
//! Fleet submissions are chunked to pace emission. Every station still gets
//! its own task, so one bad station cannot fail its neighbours.
//!
//! `stop` never waits on a full queue: pending sends give up with
//! `QueueClosed`, and jobs still queued are marked terminal.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::configs::config_sync::TaskConfig;
use crate::core::freshness_cache::FreshnessCache;
use crate::core::refresh::{RefreshMode, StationRefresher};
use crate::errors::{SyncError, SyncResult};
use crate::stations::model::now_unix_ms;

/// Finished records kept for inspection before the oldest are dropped.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub chunk_size: usize,
    pub chunk_pause: Duration,
    pub queue_capacity: usize,
    pub history_limit: usize,
    /// Upper bound on one attempt.
    pub task_timeout: Duration,
    /// Task starts per minute across the pool. `None` means unlimited.
    pub rate_per_minute: Option<u32>,
}

impl From<&TaskConfig> for DispatcherConfig {
    fn from(config: &TaskConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(config.retry_max_delay_ms),
            chunk_size: config.chunk_size.max(1),
            chunk_pause: Duration::from_millis(config.chunk_pause_ms),
            queue_capacity: config.queue_capacity.max(1),
            history_limit: DEFAULT_HISTORY_LIMIT,
            task_timeout: Duration::from_millis(config.task_timeout_ms.max(1)),
            rate_per_minute: (config.rate_limit_per_minute > 0).then_some(config.rate_limit_per_minute),
        }
    }
}

impl DispatcherConfig {
    /// Delay before retry number `retries + 1`.
    pub fn backoff(&self, retries: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(retries))
            .min(self.retry_max_delay)
    }
}

/// Evenly spaced start slots, shared by every worker.
#[derive(Debug)]
struct StartPacer {
    spacing: Duration,
    next_slot: Option<Instant>,
}

impl StartPacer {
    fn new(per_minute: u32) -> Self {
        Self {
            spacing: Duration::from_secs(60) / per_minute.max(1),
            next_slot: None,
        }
    }

    /// Claims the next free slot at or after `now`.
    fn reserve(&mut self, now: Instant) -> Instant {
        let slot = match self.next_slot {
            Some(next) if next > now => next,
            _ => now,
        };
        self.next_slot = Some(slot + self.spacing);
        slot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal)
    }
}

/// What is known about a submitted task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub station_id: String,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug)]
struct Job {
    id: Uuid,
    station_id: String,
    retries: u32,
}

#[derive(Default)]
struct TaskBook {
    records: HashMap<Uuid, TaskRecord>,
    finished: VecDeque<Uuid>,
}

struct Inner {
    refresher: Arc<StationRefresher>,
    cache: Arc<FreshnessCache>,
    config: DispatcherConfig,
    sender: mpsc::Sender<Job>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    book: Mutex<TaskBook>,
    changed: Notify,
    shutdown: CancellationToken,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    pacer: Option<AsyncMutex<StartPacer>>,
}

/// Handle to the worker pool. Cheap to clone; all clones drive the same queue.
#[derive(Clone)]
pub struct RefreshDispatcher {
    inner: Arc<Inner>,
}

impl RefreshDispatcher {
    pub fn new(refresher: Arc<StationRefresher>, config: DispatcherConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let cache = refresher.cache().clone();
        let pacer = config.rate_per_minute.map(|rate| AsyncMutex::new(StartPacer::new(rate)));
        Self {
            inner: Arc::new(Inner {
                refresher,
                cache,
                config,
                sender,
                receiver: Arc::new(AsyncMutex::new(receiver)),
                book: Mutex::new(TaskBook::default()),
                changed: Notify::new(),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                handles: Mutex::new(Vec::new()),
                pacer,
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Spawns the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.inner.handles();
        for worker_id in 0..self.inner.config.workers.max(1) {
            let inner = self.inner.clone();
            handles.push(tokio::spawn(async move { inner.worker_loop(worker_id).await }));
        }
        tracing::info!(workers = self.inner.config.workers, "refresh dispatcher started");
    }

    /// Refreshes every cached station on each tick of `interval` until stopped.
    pub fn spawn_periodic_refresh(&self, interval: Duration) {
        let dispatcher = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = dispatcher.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match dispatcher.refresh_cached_stations().await {
                            Ok(ids) => tracing::debug!(tasks = ids.len(), "periodic refresh submitted"),
                            Err(SyncError::QueueClosed) => break,
                            Err(e) => tracing::warn!(error = %e, "periodic refresh failed"),
                        }
                    }
                }
            }
        });
        self.inner.handles().push(handle);
    }

    /// Cancels workers and timers, waits for them to finish their current task,
    /// then marks every job left in the queue as abandoned.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.inner.handles().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "dispatcher task panicked");
            }
        }

        let mut abandoned = 0usize;
        {
            let mut receiver = self.inner.receiver.lock().await;
            receiver.close();
            while let Ok(job) = receiver.try_recv() {
                self.inner.abandon(job.id);
                abandoned += 1;
            }
        }
        self.inner.changed.notify_waiters();
        tracing::info!(abandoned, "refresh dispatcher stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Queues a refresh of one station. Waits for room when the queue is full.
    pub async fn submit(&self, station_id: &str) -> SyncResult<Uuid> {
        if station_id.is_empty() {
            return Err(SyncError::InvalidInput("station id must not be empty".into()));
        }
        if self.is_stopped() {
            return Err(SyncError::QueueClosed);
        }
        let id = Uuid::new_v4();
        let now = now_unix_ms();
        self.inner.book().records.insert(
            id,
            TaskRecord {
                id,
                station_id: station_id.to_string(),
                state: TaskState::Pending,
                attempts: 0,
                last_error: None,
                created_at_ms: now,
                updated_at_ms: now,
            },
        );

        let job = Job {
            id,
            station_id: station_id.to_string(),
            retries: 0,
        };
        if let Err(e) = self.inner.enqueue(job).await {
            self.inner.book().records.remove(&id);
            return Err(e);
        }
        tracing::debug!(task_id = %id, station_id, "task submitted");
        Ok(id)
    }

    /// One task per station, emitted `chunk_size` at a time.
    pub async fn submit_fleet(&self, station_ids: &[String]) -> SyncResult<Vec<Uuid>> {
        let chunk_size = self.inner.config.chunk_size.max(1);
        let mut ids = Vec::with_capacity(station_ids.len());
        for (index, chunk) in station_ids.chunks(chunk_size).enumerate() {
            for station_id in chunk {
                ids.push(self.submit(station_id).await?);
            }
            tracing::debug!(chunk = index, size = chunk.len(), "fleet chunk submitted");
            if self.inner.config.chunk_pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => return Err(SyncError::QueueClosed),
                    _ = tokio::time::sleep(self.inner.config.chunk_pause) => {}
                }
            }
        }
        tracing::info!(stations = station_ids.len(), "fleet refresh submitted");
        Ok(ids)
    }

    /// Submits a fleet task for every station that has a cache entry.
    pub async fn refresh_cached_stations(&self) -> SyncResult<Vec<Uuid>> {
        let station_ids = self.inner.cache.list_cached_station_ids().await?;
        if station_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.submit_fleet(&station_ids).await
    }

    pub fn task(&self, id: Uuid) -> Option<TaskRecord> {
        self.inner.book().records.get(&id).cloned()
    }

    /// Waits until the task finishes or `timeout` passes, returning its latest record.
    pub async fn wait_for(&self, id: Uuid, timeout: Duration) -> Option<TaskRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            let record = self.task(id)?;
            if record.state.is_finished() || self.is_stopped() {
                return Some(record);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.task(id);
            }
        }
    }
}

impl Inner {
    fn book(&self) -> MutexGuard<'_, TaskBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends unless shutdown wins first.
    async fn enqueue(&self, job: Job) -> SyncResult<()> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SyncError::QueueClosed),
            sent = self.sender.send(job) => sent.map_err(|_| SyncError::QueueClosed),
        }
    }

    fn abandon(&self, id: Uuid) {
        self.update(id, |r| {
            r.state = TaskState::FailedTerminal;
            r.last_error = Some("abandoned at shutdown".to_string());
        });
    }

    /// Waits for a start slot. Returns false when shutdown arrives first.
    async fn pace(&self) -> bool {
        let Some(pacer) = &self.pacer else {
            return true;
        };
        let slot = pacer.lock().await.reserve(Instant::now());
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep_until(slot) => true,
        }
    }

    fn update(&self, id: Uuid, apply: impl FnOnce(&mut TaskRecord)) {
        {
            let mut book = self.book();
            let Some(record) = book.records.get_mut(&id) else {
                return;
            };
            apply(record);
            record.updated_at_ms = now_unix_ms();
            if record.state.is_finished() {
                book.finished.push_back(id);
                while book.finished.len() > self.config.history_limit {
                    if let Some(old) = book.finished.pop_front() {
                        book.records.remove(&old);
                    }
                }
            }
        }
        self.changed.notify_waiters();
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::debug!(worker_id, "worker started");
        loop {
            let job = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                job = async { self.receiver.lock().await.recv().await } => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            if !self.pace().await {
                self.abandon(job.id);
                break;
            }
            self.clone().run(job).await;
        }
        tracing::debug!(worker_id, "worker stopped");
    }

    async fn run(self: Arc<Self>, job: Job) {
        self.update(job.id, |r| {
            r.state = TaskState::Running;
            r.attempts += 1;
        });

        let timeout = self.config.task_timeout;
        let result = tokio::time::timeout(timeout, self.refresher.refresh(&job.station_id, RefreshMode::Strict))
            .await
            .unwrap_or_else(|_| {
                Err(SyncError::TransientNetwork(format!(
                    "task exceeded {} ms",
                    timeout.as_millis()
                )))
            });

        match result {
            Ok(report) => {
                tracing::debug!(task_id = %job.id, station_id = %job.station_id, ports = report.snapshot.ports.len(), "task succeeded");
                self.update(job.id, |r| {
                    r.state = TaskState::Succeeded;
                    r.last_error = None;
                });
            }
            Err(error) if error.is_retryable() && job.retries < self.config.max_retries => {
                let delay = self.config.backoff(job.retries);
                tracing::warn!(
                    task_id = %job.id,
                    station_id = %job.station_id,
                    attempt = job.retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    reason = %error,
                    "task failed, retry scheduled"
                );
                let message = error.to_string();
                self.update(job.id, |r| {
                    r.state = TaskState::FailedRetryable;
                    r.last_error = Some(message);
                });
                self.schedule_retry(job, delay);
            }
            Err(error) => {
                tracing::error!(
                    task_id = %job.id,
                    station_id = %job.station_id,
                    attempts = job.retries + 1,
                    reason = %error,
                    "task failed terminally"
                );
                let message = error.to_string();
                self.update(job.id, |r| {
                    r.state = TaskState::FailedTerminal;
                    r.last_error = Some(message);
                });
            }
        }
    }

    fn schedule_retry(self: Arc<Self>, job: Job, delay: Duration) {
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => self.abandon(job.id),
                _ = tokio::time::sleep(delay) => {
                    let id = job.id;
                    self.update(id, |r| r.state = TaskState::Pending);
                    let retry = Job { retries: job.retries + 1, ..job };
                    if self.enqueue(retry).await.is_err() {
                        self.abandon(id);
                    }
                }
            }
        });
    }
}
