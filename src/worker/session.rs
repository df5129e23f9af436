use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::error::{Result, SchedError};
use crate::resources::Resources;
use crate::scheduler::control::SchedMessage;
use crate::scheduler::request::{SchedWindow, SchedWindowRequest, WorkerRequest};
use crate::scheduler::tracker::{WorkStage, WorkTracker};
use crate::selector::SectorAffinity;
use crate::worker::heartbeat::{probe, Health};
use crate::worker::{Worker, WorkerAction, WorkerHandle};

/// Scheduler side driver of one worker: keeps windows open, starts assigned
/// work as capacity frees up and watches the worker's health.
pub(crate) struct WorkerSession {
    pub handle: Arc<WorkerHandle>,
    pub mailbox: mpsc::Sender<SchedMessage>,
    pub tracker: Arc<WorkTracker>,
    pub affinity: Arc<SectorAffinity>,
    pub session_id: Uuid,
    pub sched_windows: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl WorkerSession {
    pub async fn run(self) {
        let id = self.handle.id;
        let (window_tx, mut window_rx) = mpsc::channel::<SchedWindow>(self.sched_windows.max(1));

        let mut heartbeat = interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut requested = 0usize;
        let mut epoch = self.handle.disable_epoch();
        // set when this session disabled the worker for failing heartbeats
        let mut unhealthy = false;
        let mut restarted = false;

        tracing::debug!(worker = %id, "Worker session started");

        'session: loop {
            // open windows of an older epoch were dropped by the scheduler
            let current = self.handle.disable_epoch();
            if current != epoch {
                epoch = current;
                requested = 0;
            }

            if self.handle.enabled() {
                while requested < self.sched_windows {
                    let req = SchedWindowRequest {
                        worker: id,
                        done: window_tx.clone(),
                    };
                    tokio::select! {
                        biased;
                        _ = self.handle.closing.cancelled() => break 'session,
                        res = self.mailbox.send(SchedMessage::WindowRequest(req)) => {
                            if res.is_err() {
                                break 'session;
                            }
                        }
                    }
                    requested += 1;
                }
            }

            tokio::select! {
                biased;

                _ = self.handle.closing.cancelled() => break,

                Some(window) = window_rx.recv() => {
                    requested = requested.saturating_sub(1);
                    self.handle.push_window(window);
                    // a disable may have taken the windows just before the push
                    if !self.handle.enabled() {
                        self.disable(self.handle.take_windows()).await;
                    }
                }

                _ = self.handle.woken() => {}

                _ = heartbeat.tick() => {
                    match probe(self.handle.worker().as_ref(), self.session_id, self.heartbeat_timeout).await {
                        Health::Alive => {
                            if unhealthy && !self.handle.enabled() {
                                tracing::info!(worker = %id, "Worker healthy again");
                                unhealthy = false;
                                self.enable().await;
                            }
                        }
                        Health::Unreachable(reason) => {
                            if self.handle.enabled() {
                                tracing::warn!(worker = %id, reason = %reason, "Worker heartbeat failed, disabling");
                                unhealthy = true;
                                self.disable(Vec::new()).await;
                            }
                        }
                        Health::Restarted(session) => {
                            tracing::warn!(
                                worker = %id,
                                session = %session,
                                "Worker restarted, it has to register again"
                            );
                            restarted = true;
                            break;
                        }
                    }
                }
            }

            self.start_ready_work();
        }

        // windows already filled for us go to the handle, where the
        // scheduler picks them up when it removes or closes the worker
        window_rx.close();
        while let Ok(window) = window_rx.try_recv() {
            self.handle.push_window(window);
        }

        if restarted {
            self.remove().await;
        }

        tracing::debug!(worker = %id, "Worker session stopped");
        self.handle.closed.cancel();
    }

    fn start_ready_work(&self) {
        while let Some((request, need)) = self.handle.pop_ready() {
            let task = TaskRun {
                handle: Arc::clone(&self.handle),
                mailbox: self.mailbox.clone(),
                tracker: Arc::clone(&self.tracker),
                affinity: Arc::clone(&self.affinity),
            };
            tokio::spawn(task.run(request, need));
        }
    }

    /// Ask the loop to disable this worker and requeue `windows` plus
    /// everything it has not started.
    async fn disable(&self, windows: Vec<SchedWindow>) {
        let (done, rx) = oneshot::channel();
        let msg = SchedMessage::WorkerDisable {
            worker: self.handle.id,
            windows,
            done: Some(done),
        };

        tokio::select! {
            biased;
            _ = self.handle.closing.cancelled() => return,
            res = self.mailbox.send(msg) => {
                if let Err(SendError(SchedMessage::WorkerDisable { windows, .. })) = res {
                    for request in windows.into_iter().flat_map(|w| w.todo) {
                        request.respond(Err(SchedError::Closing));
                    }
                    return;
                }
            }
        }

        tokio::select! {
            _ = self.handle.closing.cancelled() => {}
            _ = rx => {}
        }
    }

    /// Drop this worker from the scheduler; its unstarted work is requeued.
    async fn remove(&self) {
        let (done, rx) = oneshot::channel();
        let msg = SchedMessage::WorkerRemove {
            worker: self.handle.id,
            done,
        };

        tokio::select! {
            biased;
            _ = self.handle.closing.cancelled() => return,
            res = self.mailbox.send(msg) => {
                if res.is_err() {
                    return;
                }
            }
        }

        tokio::select! {
            _ = self.handle.closing.cancelled() => {}
            res = rx => {
                if let Ok(Err(e)) = res {
                    tracing::debug!(worker = %self.handle.id, error = %e, "Removing restarted worker");
                }
            }
        }
    }

    async fn enable(&self) {
        let msg = SchedMessage::WorkerEnable {
            worker: self.handle.id,
            done: None,
        };
        tokio::select! {
            biased;
            _ = self.handle.closing.cancelled() => {}
            _ = self.mailbox.send(msg) => {}
        }
    }
}

/// Everything one started task needs after leaving the session.
struct TaskRun {
    handle: Arc<WorkerHandle>,
    mailbox: mpsc::Sender<SchedMessage>,
    tracker: Arc<WorkTracker>,
    affinity: Arc<SectorAffinity>,
}

impl TaskRun {
    /// Run `prepare` then `work` with `need` reserved in `preparing`.
    async fn run(self, request: WorkerRequest, need: Resources) {
        let task = request.task_type;
        let handle = &self.handle;

        if request.is_cancelled() {
            handle.release_preparing(task, &need);
            self.capacity_freed();
            tracing::debug!(sched_id = %request.sched_id, worker = %handle.id, "Caller gone, not starting task");
            request.respond(Err(SchedError::Cancelled));
            return;
        }

        let WorkerRequest {
            sector,
            sched_id,
            prepare,
            work,
            reply,
            ..
        } = request;

        self.tracker.start(sched_id, handle.id, sector.id, task);
        self.affinity.record(sector.id, &handle.info().hostname);
        tracing::debug!(sched_id = %sched_id, worker = %handle.id, task = %task, sector = %sector.id, "Task started");

        let worker = handle.worker();
        let result = match run_action("prepare", prepare, Arc::clone(&worker)).await {
            Ok(()) => {
                handle.activate(task, &need);
                self.tracker.set_stage(sched_id, WorkStage::Running);
                let res = run_action("work", work, worker).await;
                handle.release_active(task, &need);
                res
            }
            Err(e) => {
                handle.release_preparing(task, &need);
                Err(e)
            }
        };

        self.tracker.finish(sched_id);
        self.capacity_freed();

        match &result {
            Ok(()) => tracing::debug!(sched_id = %sched_id, worker = %handle.id, task = %task, "Task finished"),
            Err(e) => tracing::error!(
                sched_id = %sched_id,
                worker = %handle.id,
                task = %task,
                sector = %sector.id,
                error = %e,
                "Task failed"
            ),
        }

        reply.send(result);
    }

    fn capacity_freed(&self) {
        // dropped when the mailbox is full; a pass is pending then anyway
        let _ = self.mailbox.try_send(SchedMessage::WorkerChange);
    }
}

/// Run one phase of a task. A panicking action becomes a worker error so the
/// reservation and the tracker entry are still released.
async fn run_action(phase: &'static str, action: WorkerAction, worker: Arc<dyn Worker>) -> Result<()> {
    match AssertUnwindSafe(async move { action(worker).await })
        .catch_unwind()
        .await
    {
        Ok(res) => res,
        Err(payload) => Err(SchedError::Worker(format!(
            "{} panicked: {}",
            phase,
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
