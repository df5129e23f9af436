use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::resources::{ActiveResources, Resources};
use crate::scheduler::request::{SchedWindow, WorkerRequest};
use crate::sector::TaskType;
use crate::worker::{StoragePath, Worker, WorkerId, WorkerInfo};

#[derive(Debug, Default)]
struct TaskCache {
    tasks: HashSet<TaskType>,
    updated: Option<Instant>,
}

#[derive(Debug, Default)]
struct Usage {
    preparing: ActiveResources,
    active: ActiveResources,
}

/// Scheduler-side state of one connected worker.
///
/// Lock order: `windows` before `usage`. Neither is held across an await.
pub struct WorkerHandle {
    pub id: WorkerId,
    worker: Arc<dyn Worker>,
    info: WorkerInfo,

    tasks: tokio::sync::Mutex<TaskCache>,
    task_cache_ttl: Duration,

    usage: Mutex<Usage>,
    windows: Mutex<Vec<SchedWindow>>,

    enabled: AtomicBool,
    /// Bumped on every disable; open windows of older epochs were dropped.
    disable_epoch: AtomicU64,
    wake: Notify,

    pub(crate) closing: CancellationToken,
    pub(crate) closed: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerHandle {
    pub fn new(id: WorkerId, worker: Arc<dyn Worker>, info: WorkerInfo, task_cache_ttl: Duration) -> Self {
        Self {
            id,
            worker,
            info,
            tasks: tokio::sync::Mutex::new(TaskCache::default()),
            task_cache_ttl,
            usage: Mutex::new(Usage::default()),
            windows: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
            disable_epoch: AtomicU64::new(0),
            wake: Notify::new(),
            closing: CancellationToken::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn worker(&self) -> Arc<dyn Worker> {
        Arc::clone(&self.worker)
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Only called from the scheduler's control loop.
    pub(crate) fn set_enabled(&self, enabled: bool) {
        if !enabled {
            self.disable_epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub(crate) fn disable_epoch(&self) -> u64 {
        self.disable_epoch.load(Ordering::SeqCst)
    }

    /// Supported task types, refreshed from the worker once the cache is stale.
    pub async fn task_types(&self) -> HashSet<TaskType> {
        let mut cache = self.tasks.lock().await;
        let stale = cache
            .updated
            .map(|at| at.elapsed() >= self.task_cache_ttl)
            .unwrap_or(true);

        if stale {
            match self.worker.task_types().await {
                Ok(tasks) => {
                    cache.tasks = tasks;
                    cache.updated = Some(Instant::now());
                }
                Err(e) => {
                    tracing::warn!(worker = %self.id, error = %e, "Failed to refresh worker task types");
                }
            }
        }

        cache.tasks.clone()
    }

    /// Drop the cached task types so the next lookup asks the worker.
    pub async fn invalidate_task_types(&self) {
        self.tasks.lock().await.updated = None;
    }

    pub async fn paths(&self) -> Result<Vec<StoragePath>> {
        self.worker.paths().await
    }

    pub fn preparing(&self) -> ActiveResources {
        lock(&self.usage).preparing.clone()
    }

    pub fn active(&self) -> ActiveResources {
        lock(&self.usage).active.clone()
    }

    /// `preparing + active`.
    pub fn usage(&self) -> ActiveResources {
        let usage = lock(&self.usage);
        usage.preparing.combined(&usage.active)
    }

    pub fn utilization(&self) -> f64 {
        self.usage().utilization(&self.info.resources)
    }

    /// Reserve `need` for the staging phase if it fits next to everything else.
    pub(crate) fn try_reserve(&self, task: TaskType, need: &Resources) -> bool {
        let mut usage = lock(&self.usage);
        let res = &self.info.resources;
        if !usage.preparing.combined(&usage.active).can_handle(need, res) {
            return false;
        }
        usage.preparing.add(task, need, res);
        true
    }

    /// Move a reservation from `preparing` to `active`.
    ///
    /// # Panics
    ///
    /// Panics if the reservation was never made or the total would exceed capacity.
    pub(crate) fn activate(&self, task: TaskType, need: &Resources) {
        let mut usage = lock(&self.usage);
        let res = &self.info.resources;
        usage.preparing.free(task, need, res);
        usage.active.add(task, need, res);
        assert!(
            usage.preparing.combined(&usage.active).within(res),
            "worker {} over capacity after activating {}",
            self.id,
            task
        );
    }

    pub(crate) fn release_preparing(&self, task: TaskType, need: &Resources) {
        lock(&self.usage).preparing.free(task, need, &self.info.resources);
        self.wake.notify_one();
    }

    pub(crate) fn release_active(&self, task: TaskType, need: &Resources) {
        lock(&self.usage).active.free(task, need, &self.info.resources);
        self.wake.notify_one();
    }

    pub(crate) fn push_window(&self, window: SchedWindow) {
        lock(&self.windows).push(window);
        self.wake.notify_one();
    }

    /// Take every window not yet started, e.g. to requeue it.
    pub(crate) fn take_windows(&self) -> Vec<SchedWindow> {
        std::mem::take(&mut *lock(&self.windows))
    }

    /// Requests assigned to this worker that have not started yet.
    pub fn queued_tasks(&self) -> usize {
        lock(&self.windows).iter().map(|w| w.todo.len()).sum()
    }

    /// Pop the next assigned request if its resources can be reserved now.
    /// Nothing starts on a disabled worker; its windows wait to be requeued.
    ///
    /// Windows are worked in order, so a large request at the front holds back
    /// the ones behind it.
    pub(crate) fn pop_ready(&self) -> Option<(WorkerRequest, Resources)> {
        let mut windows = lock(&self.windows);
        if !self.enabled() {
            return None;
        }
        windows.retain(|w| !w.todo.is_empty());

        let window = windows.first_mut()?;
        let need = self.info.resources.spec(window.todo[0].seal_task());
        if !self.try_reserve(window.todo[0].task_type, &need) {
            return None;
        }

        Some((window.todo.remove(0), need))
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await
    }
}

/// Handle over an in-process worker, for tests.
#[cfg(test)]
pub(crate) fn local_handle(worker: Arc<crate::worker::LocalWorker>) -> Arc<WorkerHandle> {
    let info = worker.worker_info();
    Arc::new(WorkerHandle::new(
        WorkerId(uuid::Uuid::new_v4()),
        worker,
        info,
        Duration::from_secs(60),
    ))
}
