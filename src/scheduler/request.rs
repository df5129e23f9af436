use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::resources::ActiveResources;
use crate::sector::{SealTaskType, SectorRef, TaskType};
use crate::selector::WorkerSelector;
use crate::worker::{WorkerAction, WorkerId};

pub const DEFAULT_SCHED_PRIORITY: i32 = 0;

/// Caller side context of a scheduling call: cancellation plus priority.
#[derive(Debug, Clone, Default)]
pub struct SchedContext {
    cancel: CancellationToken,
    priority: i32,
}

impl SchedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context cancelled together with `token`.
    pub fn with_cancel(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            priority: DEFAULT_SCHED_PRIORITY,
        }
    }

    /// Larger values are more urgent.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The single-use reply path of a request.
pub(crate) struct Reply {
    sched_id: Uuid,
    ret: oneshot::Sender<Result<()>>,
}

impl Reply {
    pub(crate) fn channel(sched_id: Uuid) -> (Self, oneshot::Receiver<Result<()>>) {
        let (ret, rx) = oneshot::channel();
        (Self { sched_id, ret }, rx)
    }

    /// Consumes the reply, so a request is answered at most once.
    pub(crate) fn send(self, result: Result<()>) {
        if self.ret.send(result).is_err() {
            tracing::warn!(sched_id = %self.sched_id, "request got cancelled before we could respond");
        }
    }
}

/// One pending unit of work.
pub struct WorkerRequest {
    pub sector: SectorRef,
    pub task_type: TaskType,
    /// Larger values are more urgent.
    pub priority: i32,
    pub sel: Arc<dyn WorkerSelector>,
    pub sched_id: Uuid,
    pub submitted_at: DateTime<Utc>,
    /// Submission order; breaks ties within a priority.
    pub(crate) seq: u64,
    pub(crate) prepare: WorkerAction,
    pub(crate) work: WorkerAction,
    pub(crate) reply: Reply,
    pub(crate) cancel: CancellationToken,
}

impl WorkerRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: &SchedContext,
        seq: u64,
        sector: SectorRef,
        task_type: TaskType,
        sel: Arc<dyn WorkerSelector>,
        prepare: WorkerAction,
        work: WorkerAction,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let sched_id = Uuid::new_v4();
        let (reply, rx) = Reply::channel(sched_id);
        let request = Self {
            sector,
            task_type,
            priority: ctx.priority(),
            sel,
            sched_id,
            submitted_at: Utc::now(),
            seq,
            prepare,
            work,
            reply,
            cancel: ctx.token().clone(),
        };
        (request, rx)
    }

    pub fn seal_task(&self) -> SealTaskType {
        SealTaskType {
            task_type: self.task_type,
            proof: self.sector.proof_type,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn respond(self, result: Result<()>) {
        self.reply.send(result);
    }
}

impl fmt::Debug for WorkerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRequest")
            .field("sched_id", &self.sched_id)
            .field("sector", &self.sector.id)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Spare capacity a worker offered, and the requests placed into it.
#[derive(Debug, Default)]
pub struct SchedWindow {
    pub allocated: ActiveResources,
    pub todo: Vec<WorkerRequest>,
}

/// A worker asking for a window to be filled.
#[derive(Debug)]
pub struct SchedWindowRequest {
    pub worker: WorkerId,
    pub(crate) done: mpsc::Sender<SchedWindow>,
}
