use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedError};
use crate::scheduler::assigner::new_assigner;
use crate::scheduler::control::{SchedLoop, SchedMessage, SchedState};
use crate::scheduler::diag::SchedDiagInfo;
use crate::scheduler::request::{SchedContext, WorkerRequest};
use crate::scheduler::tracker::WorkTracker;
use crate::scheduler::WorkerTable;
use crate::sector::{SectorRef, TaskType};
use crate::selector::{SectorAffinity, WorkerSelector};
use crate::worker::session::WorkerSession;
use crate::worker::{Worker, WorkerAction, WorkerHandle, WorkerId};

/// Cloneable handle to a running scheduler.
#[derive(Clone)]
pub struct Scheduler {
    mailbox: mpsc::Sender<SchedMessage>,
    workers: Arc<RwLock<WorkerTable>>,
    tracker: Arc<WorkTracker>,
    affinity: Arc<SectorAffinity>,
    config: SchedulerConfig,
    seq: Arc<AtomicU64>,
    closing: CancellationToken,
    closed: CancellationToken,
}

impl Scheduler {
    /// Create the handle and the control loop that serves it. Nothing is
    /// processed until [`SchedLoop::run`] is polled.
    pub fn new(config: SchedulerConfig) -> (Self, SchedLoop) {
        let (mailbox, rx) = mpsc::channel(config.mailbox_size.max(1));
        let workers = Arc::new(RwLock::new(WorkerTable::new()));
        let tracker = Arc::new(WorkTracker::new());
        let closing = CancellationToken::new();
        let closed = CancellationToken::new();

        let sched_loop = SchedLoop {
            mailbox: rx,
            state: SchedState::default(),
            workers: Arc::clone(&workers),
            tracker: Arc::clone(&tracker),
            assigner: new_assigner(config.assigner),
            config: config.clone(),
            closing: closing.clone(),
            closed: closed.clone(),
        };

        let sched = Self {
            mailbox,
            workers,
            tracker,
            affinity: Arc::new(SectorAffinity::new()),
            config,
            seq: Arc::new(AtomicU64::new(0)),
            closing,
            closed,
        };

        (sched, sched_loop)
    }

    /// [`new`](Self::new) with the loop spawned on the current runtime.
    pub fn start(config: SchedulerConfig) -> (Self, JoinHandle<()>) {
        let (sched, sched_loop) = Self::new(config);
        let task = tokio::spawn(sched_loop.run());
        (sched, task)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Sector to host bindings recorded as tasks start.
    pub fn affinity(&self) -> Arc<SectorAffinity> {
        Arc::clone(&self.affinity)
    }

    pub fn tracker(&self) -> Arc<WorkTracker> {
        Arc::clone(&self.tracker)
    }

    /// Submit a task and wait for it to finish.
    ///
    /// Returns once the request was answered: the result of `work` (or of
    /// `prepare` if that failed), [`SchedError::RequestRemoved`] after a
    /// removal, [`SchedError::Closing`] if the scheduler shut down first, or
    /// [`SchedError::Cancelled`] when `ctx` is cancelled before the task ran.
    pub async fn schedule(
        &self,
        ctx: &SchedContext,
        sector: SectorRef,
        task_type: TaskType,
        sel: Arc<dyn WorkerSelector>,
        prepare: WorkerAction,
        work: WorkerAction,
    ) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (request, mut ret) = WorkerRequest::new(ctx, seq, sector, task_type, sel, prepare, work);
        let sched_id = request.sched_id;

        tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(SchedError::Closing),
            _ = ctx.token().cancelled() => return Err(SchedError::Cancelled),
            res = self.mailbox.send(SchedMessage::Schedule(request)) => {
                res.map_err(|_| SchedError::Closing)?;
            }
        }

        tokio::select! {
            biased;
            res = &mut ret => res.map_err(|_| SchedError::ResponseDropped)?,
            _ = ctx.token().cancelled() => {
                match self.remove(sched_id).await {
                    Ok(()) => tracing::debug!(sched_id = %sched_id, "Cancelled request removed from queue"),
                    Err(SchedError::RequestNotFound(_)) | Err(SchedError::Closing) => {}
                    Err(e) => tracing::warn!(sched_id = %sched_id, error = %e, "Removing cancelled request"),
                }
                Err(SchedError::Cancelled)
            }
        }
    }

    /// Remove a still queued request. Fails with
    /// [`SchedError::RequestNotFound`] once it was handed to a worker.
    pub async fn remove_request(&self, ctx: &SchedContext, sched_id: Uuid) -> Result<()> {
        tokio::select! {
            res = self.remove(sched_id) => res,
            _ = ctx.token().cancelled() => Err(SchedError::Cancelled),
        }
    }

    async fn remove(&self, sched_id: Uuid) -> Result<()> {
        let (res, rx) = oneshot::channel();
        self.call(SchedMessage::Remove { sched_id, res }, rx).await?
    }

    /// Snapshot of queued requests, open windows, workers and running tasks.
    pub async fn info(&self, ctx: &SchedContext) -> Result<SchedDiagInfo> {
        let (tx, rx) = oneshot::channel();
        tokio::select! {
            res = self.call(SchedMessage::Info(tx), rx) => res,
            _ = ctx.token().cancelled() => Err(SchedError::Cancelled),
        }
    }

    /// Send a message to the loop and wait for its answer.
    async fn call<T>(&self, msg: SchedMessage, rx: oneshot::Receiver<T>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(SchedError::Closing),
            res = self.mailbox.send(msg) => res.map_err(|_| SchedError::Closing)?,
        }
        rx.await.map_err(|_| SchedError::Closing)
    }

    /// Add a worker and start its session. The worker's session id becomes
    /// its [`WorkerId`].
    pub async fn register_worker(&self, worker: Arc<dyn Worker>) -> Result<WorkerId> {
        if self.closing.is_cancelled() {
            return Err(SchedError::Closing);
        }

        let info = worker.info().await?;
        let session_id = worker.session().await?;
        let id = WorkerId(session_id);

        let handle = {
            let mut workers = self.workers.write().await;
            if workers.contains_key(&id) {
                return Err(SchedError::WorkerAlreadyRegistered(id));
            }
            let handle = Arc::new(WorkerHandle::new(id, worker, info, self.config.task_cache_ttl()));
            workers.insert(id, Arc::clone(&handle));
            handle
        };

        tracing::info!(
            worker = %id,
            hostname = %handle.info().hostname,
            cpus = handle.info().resources.cpus,
            gpus = handle.info().resources.gpus.len(),
            "Worker registered"
        );

        let session = WorkerSession {
            handle,
            mailbox: self.mailbox.clone(),
            tracker: Arc::clone(&self.tracker),
            affinity: Arc::clone(&self.affinity),
            session_id,
            sched_windows: self.config.sched_windows,
            heartbeat_interval: self.config.heartbeat_interval(),
            heartbeat_timeout: self.config.heartbeat_timeout(),
        };
        tokio::spawn(session.run());

        Ok(id)
    }

    /// Stop assigning to a worker; its not yet started work goes back to the queue.
    pub async fn disable_worker(&self, worker: WorkerId) -> Result<()> {
        let (done, rx) = oneshot::channel();
        let msg = SchedMessage::WorkerDisable {
            worker,
            windows: Vec::new(),
            done: Some(done),
        };
        self.call(msg, rx).await?
    }

    pub async fn enable_worker(&self, worker: WorkerId) -> Result<()> {
        let (done, rx) = oneshot::channel();
        let msg = SchedMessage::WorkerEnable {
            worker,
            done: Some(done),
        };
        self.call(msg, rx).await?
    }

    /// Tell the scheduler a worker's capabilities changed.
    pub async fn worker_changed(&self, worker: WorkerId) -> Result<()> {
        let handle = self
            .workers
            .read()
            .await
            .get(&worker)
            .cloned()
            .ok_or(SchedError::WorkerNotFound(worker))?;
        handle.invalidate_task_types().await;
        // a full mailbox already has a pass coming
        let _ = self.mailbox.try_send(SchedMessage::WorkerChange);
        Ok(())
    }

    /// Stop a worker's session and forget it. Work it already started
    /// finishes; work it had not started is requeued.
    pub async fn unregister_worker(&self, worker: WorkerId) -> Result<()> {
        let handle = self
            .workers
            .read()
            .await
            .get(&worker)
            .cloned()
            .ok_or(SchedError::WorkerNotFound(worker))?;

        handle.closing.cancel();
        if tokio::time::timeout(self.config.cleanup_timeout(), handle.closed.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(worker = %worker, "Worker session did not stop in time");
        }

        let (done, rx) = oneshot::channel();
        self.call(SchedMessage::WorkerRemove { worker, done }, rx).await?
    }

    pub async fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Shut the scheduler down and wait until it is closed.
    pub async fn close(&self) {
        self.closing.cancel();
        self.closed.cancelled().await;
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}
