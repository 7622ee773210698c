/// the reload scheduler: a timer loop for full reloads and a worker loop draining the task queue.
///
/// Both loops share one cancellation token issued by `start`; `stop` cancels it and waits for
/// both to finish. Whether the timer loop reloads at all is an `active` flag on the instance.
///
use async_std::task::JoinHandle;
use domain_keys::keys::RouteKey;
use futures::FutureExt;
use log::*;
use service_uptime::Uptime;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::cache::tiered::TieredCache;
use crate::cancel::CancelToken;
use crate::collection::{EntryCollection, ReloadOutcome};
use crate::config::SchedulerConfig;
use crate::error::StaticDataError;
use crate::queue::{ReloadTask, ReloadTaskQueue};
use crate::worker::{WorkerState, WorkerStatus, DOWN, OK};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub reloads: u64,
    pub skipped: u64,
    pub tasks_run: u64,
    pub task_timeouts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reloads: AtomicU64,
    skipped: AtomicU64,
    tasks_run: AtomicU64,
    task_timeouts: AtomicU64,
    errors: AtomicU16,
}

// state shared with the spawned loops
struct Shared {
    config: SchedulerConfig,
    collection: Arc<EntryCollection>,
    cache: Arc<TieredCache>,
    queue: Arc<ReloadTaskQueue>,
    active: AtomicBool,
    counters: Counters,
}

struct Running {
    cancel: CancelToken,
    timer: JoinHandle<()>,
    worker: JoinHandle<()>,
}

pub struct ReloadScheduler {
    id: String,
    uptime: Uptime,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ReloadScheduler {
    pub fn new(
        config: SchedulerConfig,
        collection: Arc<EntryCollection>,
        cache: Arc<TieredCache>,
        queue: Arc<ReloadTaskQueue>,
    ) -> ReloadScheduler {
        let shared = Shared {
            config,
            collection,
            cache,
            queue,
            active: AtomicBool::new(true),
            counters: Counters::default(),
        };

        ReloadScheduler {
            id: RouteKey::create(),
            uptime: Uptime::new(),
            shared: Arc::new(shared),
            running: Mutex::new(None),
        }
    }

    pub fn id(&self) -> String {
        self.id.to_string()
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// enable or pause the timer's full reloads; read on every tick
    pub fn set_active(&self, active: bool) {
        info!("scheduler {} active: {}", self.id, active);
        self.shared.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// spawn both loops under a fresh token; a second start while running is a no-op
    pub fn start(&self) {
        let mut running = self.running();
        if running.is_some() {
            warn!("scheduler {} already running", self.id);
            return;
        }

        let cancel = CancelToken::new();
        info!("starting reload scheduler, id: {}", self.id);

        let timer = {
            let shared = self.shared.clone();
            let cancel = cancel.clone();
            async_std::task::spawn(async move { timer_loop(shared, cancel).await })
        };
        let worker = {
            let shared = self.shared.clone();
            let cancel = cancel.clone();
            async_std::task::spawn(async move { worker_loop(shared, cancel).await })
        };

        *running = Some(Running {
            cancel,
            timer,
            worker,
        });
    }

    /// cancel the loops and wait for them to drain
    pub async fn stop(&self) {
        let running = self.running().take();
        if let Some(running) = running {
            info!("stopping reload scheduler, id: {}", self.id);
            running.cancel.cancel();
            running.timer.await;
            running.worker.await;
            info!("reload scheduler {} stopped", self.id);
        }
    }

    /// run one full reload now, outside the timer
    pub async fn reload_now(&self) -> Option<ReloadOutcome> {
        let cancel = match self.running().as_ref() {
            Some(r) => r.cancel.clone(),
            None => CancelToken::new(),
        };
        self.shared.full_reload(&cancel).await
    }

    /// drain the queue in the caller's task; returns the number of tasks run
    pub async fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Some(task) = self.shared.queue.try_dequeue() {
            self.shared.run_task(task).await;
            count += 1;
        }
        count
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            reloads: c.reloads.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            tasks_run: c.tasks_run.load(Ordering::Relaxed),
            task_timeouts: c.task_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        let (status, state) = if !self.is_running() {
            (DOWN, WorkerState::Shutdown)
        } else if self.shared.collection.is_reloading() {
            (OK, WorkerState::Busy)
        } else {
            (OK, WorkerState::Idle)
        };

        WorkerStatus::new(
            self.id(),
            status.to_string(),
            state,
            self.uptime.to_string(),
            self.shared.counters.errors.load(Ordering::Relaxed),
        )
    }
}

impl Shared {
    fn error(&self) {
        let _ = self
            .counters
            .errors
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_add(1)));
    }

    async fn full_reload(&self, cancel: &CancelToken) -> Option<ReloadOutcome> {
        match self.collection.reload(cancel).await {
            Ok(ReloadOutcome::Skipped) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                Some(ReloadOutcome::Skipped)
            }
            Ok(outcome) => {
                self.counters.reloads.fetch_add(1, Ordering::Relaxed);
                let snapshot = self.collection.snapshot();
                self.cache.publish(&snapshot).await;
                self.collection.set_memory_cache(&self.cache, None).await;
                Some(outcome)
            }
            Err(StaticDataError::Cancelled) => {
                info!("full reload cancelled");
                None
            }
            Err(e) => {
                self.error();
                error!("full reload failed: {}", e);
                None
            }
        }
    }

    fn budget(&self, task: &ReloadTask) -> Duration {
        self.collection
            .registry()
            .get(&task.setting_key)
            .and_then(|d| d.timeout())
            .unwrap_or_else(|| self.config.task_timeout())
    }

    async fn run_task(&self, task: ReloadTask) {
        let key = task.setting_key.clone();
        let budget = self.budget(&task);
        let waited = task.enqueued_at.elapsed();
        debug!("running reload task for {} after {:?} in queue", key, waited);

        let run = AssertUnwindSafe(task.run()).catch_unwind();
        match async_std::future::timeout(budget, run).await {
            Ok(Ok(())) => {
                self.counters.tasks_run.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(_)) => {
                self.error();
                error!("reload task for {} panicked", key);
            }
            Err(_) => {
                self.counters.task_timeouts.fetch_add(1, Ordering::Relaxed);
                let err = StaticDataError::QueueTimeout { key, timeout: budget };
                warn!("{}; abandoned until the next scheduled reload", err);
            }
        }
    }
}

async fn timer_loop(shared: Arc<Shared>, cancel: CancelToken) {
    let jitter = match shared.config.start_jitter_ms {
        0 => 0,
        max => fastrand::u64(0..=max),
    };
    if cancel.sleep(Duration::from_millis(jitter)).await {
        return;
    }

    let interval = shared.config.reload_interval();
    let mut last_reload = match shared.collection.reload_count() {
        0 => None,
        _ => Some(Instant::now()),
    };

    while !cancel.is_cancelled() {
        let due = last_reload.map_or(true, |at| at.elapsed() >= interval);
        if due && shared.active.load(Ordering::SeqCst) {
            shared.full_reload(&cancel).await;
            last_reload = Some(Instant::now());
        }

        if cancel.sleep(shared.config.tick()).await {
            break;
        }
    }

    debug!("timer loop stopped");
}

async fn worker_loop(shared: Arc<Shared>, cancel: CancelToken) {
    while let Some(task) = shared.queue.dequeue(&cancel).await {
        shared.run_task(task).await;
    }

    debug!("reload worker loop stopped, {} tasks left pending", shared.queue.len());
}
