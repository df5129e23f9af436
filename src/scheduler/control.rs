use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedError};
use crate::scheduler::assigner::Assigner;
use crate::scheduler::diag::{SchedDiagInfo, SchedDiagRequestInfo, WorkerDiag};
use crate::scheduler::queue::RequestQueue;
use crate::scheduler::request::{SchedWindow, SchedWindowRequest, WorkerRequest};
use crate::scheduler::tracker::WorkTracker;
use crate::scheduler::WorkerTable;
use crate::worker::WorkerId;

/// Events handled by the control loop, one at a time.
pub(crate) enum SchedMessage {
    Schedule(WorkerRequest),
    WindowRequest(SchedWindowRequest),
    /// Capacity or capabilities of some worker changed.
    WorkerChange,
    /// Disable a worker and requeue its not yet started work, including
    /// `windows` handed back by its session.
    WorkerDisable {
        worker: WorkerId,
        windows: Vec<SchedWindow>,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    WorkerEnable {
        worker: WorkerId,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    /// Disable and drop a worker whose session has stopped.
    WorkerRemove {
        worker: WorkerId,
        done: oneshot::Sender<Result<()>>,
    },
    Info(oneshot::Sender<SchedDiagInfo>),
    Remove {
        sched_id: Uuid,
        res: oneshot::Sender<Result<()>>,
    },
}

/// State owned by the control loop.
#[derive(Debug, Default)]
pub struct SchedState {
    pub(crate) queue: RequestQueue,
    pub(crate) open_windows: Vec<SchedWindowRequest>,
}

impl SchedState {
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn open_windows(&self) -> usize {
        self.open_windows.len()
    }

    /// Put unstarted work back into the queue. Requests whose caller is
    /// gone are answered instead, since nobody would remove them.
    fn requeue(&mut self, windows: Vec<SchedWindow>) -> usize {
        let mut n = 0;
        for request in windows.into_iter().flat_map(|w| w.todo) {
            if request.is_cancelled() {
                request.respond(Err(SchedError::Cancelled));
                continue;
            }
            self.queue.push(request);
            n += 1;
        }
        n
    }

    /// Answer and drop queued requests whose caller cancelled.
    fn purge_cancelled(&mut self) -> usize {
        let gone: Vec<Uuid> = self
            .queue
            .ordered()
            .into_iter()
            .filter(|r| r.is_cancelled())
            .map(|r| r.sched_id)
            .collect();
        for id in &gone {
            if let Some(request) = self.queue.take(id) {
                request.respond(Err(SchedError::Cancelled));
            }
        }
        gone.len()
    }
}

/// The control loop. Owns the queue and the open windows; everything else
/// reaches them through the mailbox.
pub struct SchedLoop {
    pub(crate) mailbox: mpsc::Receiver<SchedMessage>,
    pub(crate) state: SchedState,
    pub(crate) workers: Arc<RwLock<WorkerTable>>,
    pub(crate) tracker: Arc<WorkTracker>,
    pub(crate) assigner: Box<dyn Assigner>,
    pub(crate) config: SchedulerConfig,
    pub(crate) closing: CancellationToken,
    pub(crate) closed: CancellationToken,
}

impl SchedLoop {
    pub async fn run(mut self) {
        tracing::info!(
            assigner = self.assigner.name(),
            init_wait_ms = self.config.init_wait_ms,
            "Scheduler started"
        );

        let init = tokio::time::sleep(self.config.init_wait());
        tokio::pin!(init);
        let mut initialized = false;

        loop {
            let mut do_sched = false;

            tokio::select! {
                biased;

                _ = self.closing.cancelled() => break,

                msg = self.mailbox.recv() => match msg {
                    Some(msg) => do_sched |= self.handle(msg).await,
                    None => break,
                },

                _ = &mut init, if !initialized => {
                    initialized = true;
                    do_sched = true;
                    tracing::info!(queued = self.state.queue.len(), "Scheduler initialized, starting assignment");
                }
            }

            // handle the whole burst before a single pass
            while let Ok(msg) = self.mailbox.try_recv() {
                do_sched |= self.handle(msg).await;
            }

            if do_sched && initialized {
                self.try_sched().await;
            }
        }

        self.close().await;
    }

    /// Returns whether the event may allow new assignments.
    async fn handle(&mut self, msg: SchedMessage) -> bool {
        match msg {
            SchedMessage::Schedule(request) => {
                tracing::debug!(
                    sched_id = %request.sched_id,
                    task = %request.task_type,
                    sector = %request.sector.id,
                    priority = request.priority,
                    "Request queued"
                );
                self.state.queue.push(request)
            }
            SchedMessage::WindowRequest(window) => {
                self.state.open_windows.push(window);
                true
            }
            SchedMessage::WorkerChange => true,
            SchedMessage::WorkerDisable { worker, windows, done } => {
                let res = self.disable(worker, windows).await;
                if let Some(done) = done {
                    let _ = done.send(res);
                }
                true
            }
            SchedMessage::WorkerEnable { worker, done } => {
                let res = match self.workers.read().await.get(&worker) {
                    Some(handle) => {
                        if !handle.enabled() {
                            handle.set_enabled(true);
                            tracing::info!(worker = %worker, hostname = %handle.info().hostname, "Worker enabled");
                        }
                        Ok(())
                    }
                    None => Err(SchedError::WorkerNotFound(worker)),
                };
                if let Some(done) = done {
                    let _ = done.send(res);
                }
                true
            }
            SchedMessage::WorkerRemove { worker, done } => {
                let res = self.disable(worker, Vec::new()).await;
                if res.is_ok() {
                    self.workers.write().await.remove(&worker);
                    tracing::info!(worker = %worker, "Worker removed");
                }
                let _ = done.send(res);
                true
            }
            SchedMessage::Info(tx) => {
                let _ = tx.send(self.diag().await);
                false
            }
            SchedMessage::Remove { sched_id, res } => {
                let result = self.state.queue.remove(&sched_id);
                if result.is_ok() {
                    tracing::debug!(sched_id = %sched_id, "Request removed");
                }
                let _ = res.send(result);
                false
            }
        }
    }

    async fn disable(&mut self, worker: WorkerId, mut windows: Vec<SchedWindow>) -> Result<()> {
        let workers = self.workers.read().await;
        let handle = match workers.get(&worker) {
            Some(handle) => handle,
            None => {
                // still requeue whatever the session handed back
                let requeued = self.state.requeue(windows);
                if requeued > 0 {
                    tracing::warn!(worker = %worker, requeued, "Windows returned by unknown worker");
                }
                return Err(SchedError::WorkerNotFound(worker));
            }
        };

        let was_enabled = handle.enabled();
        handle.set_enabled(false);
        windows.extend(handle.take_windows());
        let requeued = self.state.requeue(windows);
        let before = self.state.open_windows.len();
        self.state.open_windows.retain(|w| w.worker != worker);
        let dropped = before - self.state.open_windows.len();

        if was_enabled {
            tracing::info!(
                worker = %worker,
                hostname = %handle.info().hostname,
                requeued,
                dropped_windows = dropped,
                "Worker disabled"
            );
        } else if requeued > 0 {
            tracing::debug!(worker = %worker, requeued, "Requeued work of disabled worker");
        }
        Ok(())
    }

    async fn try_sched(&mut self) {
        let purged = self.state.purge_cancelled();
        if purged > 0 {
            tracing::debug!(purged, "Dropped cancelled requests");
        }
        if self.state.queue.is_empty() || self.state.open_windows.is_empty() {
            return;
        }

        let workers = self.workers.read().await;
        let queued = self.state.queue.len();
        let windows = self.state.open_windows.len();
        let assigned = self
            .assigner
            .try_sched(&mut self.state, &workers, self.config.selector_timeout())
            .await;

        tracing::debug!(queued, windows, assigned, "Scheduling pass done");
    }

    async fn diag(&self) -> SchedDiagInfo {
        let requests = self
            .state
            .queue
            .ordered()
            .into_iter()
            .map(|r| SchedDiagRequestInfo {
                sched_id: r.sched_id,
                sector: r.sector.id,
                task_type: r.task_type,
                priority: r.priority,
                submitted_at: r.submitted_at,
            })
            .collect();

        let mut workers: Vec<WorkerDiag> = self
            .workers
            .read()
            .await
            .values()
            .map(|h| WorkerDiag {
                id: h.id,
                hostname: h.info().hostname.clone(),
                enabled: h.enabled(),
                preparing: h.preparing(),
                active: h.active(),
                utilization: h.utilization(),
                queued_tasks: h.queued_tasks(),
            })
            .collect();
        workers.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.id.cmp(&b.id)));

        SchedDiagInfo {
            requests,
            open_windows: self.state.open_windows.iter().map(|w| w.worker).collect(),
            workers,
            running: self.tracker.running(),
        }
    }

    /// Stop every worker session, then answer everything still waiting.
    async fn close(mut self) {
        tracing::info!(queued = self.state.queue.len(), "Scheduler closing");
        self.closing.cancel();
        self.mailbox.close();

        let handles: Vec<_> = self.workers.read().await.values().cloned().collect();
        let cleanup = self.config.cleanup_timeout();
        join_all(handles.iter().map(|handle| async move {
            handle.closing.cancel();
            if tokio::time::timeout(cleanup, handle.closed.cancelled()).await.is_err() {
                tracing::warn!(worker = %handle.id, "Worker session did not stop in time");
            }
        }))
        .await;

        for handle in &handles {
            let windows = handle.take_windows();
            self.state.requeue(windows);
        }
        self.state.open_windows.clear();

        while let Ok(msg) = self.mailbox.try_recv() {
            match msg {
                SchedMessage::Schedule(request) => request.respond(Err(SchedError::Closing)),
                SchedMessage::WorkerDisable { windows, done, .. } => {
                    self.state.requeue(windows);
                    if let Some(done) = done {
                        let _ = done.send(Err(SchedError::Closing));
                    }
                }
                SchedMessage::WorkerEnable { done: Some(done), .. } => {
                    let _ = done.send(Err(SchedError::Closing));
                }
                SchedMessage::WorkerRemove { done, .. } => {
                    let _ = done.send(Err(SchedError::Closing));
                }
                SchedMessage::Remove { res, .. } => {
                    let _ = res.send(Err(SchedError::Closing));
                }
                SchedMessage::Info(tx) => {
                    let _ = tx.send(self.diag().await);
                }
                SchedMessage::WindowRequest(_)
                | SchedMessage::WorkerChange
                | SchedMessage::WorkerEnable { done: None, .. } => {}
            }
        }

        let unanswered = self.state.queue.drain();
        let n = unanswered.len();
        for request in unanswered {
            request.respond(Err(SchedError::Closing));
        }

        tracing::info!(answered = n, "Scheduler closed");
        self.closed.cancel();
    }
}
