//! Read-only snapshots of scheduler state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resources::ActiveResources;
use crate::scheduler::tracker::RunningJob;
use crate::sector::{SectorId, TaskType};
use crate::worker::WorkerId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedDiagRequestInfo {
    pub sched_id: Uuid,
    pub sector: SectorId,
    pub task_type: TaskType,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDiag {
    pub id: WorkerId,
    pub hostname: String,
    pub enabled: bool,
    pub preparing: ActiveResources,
    pub active: ActiveResources,
    pub utilization: f64,
    /// Assigned but not yet started.
    pub queued_tasks: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedDiagInfo {
    /// Queued requests in dispatch order.
    pub requests: Vec<SchedDiagRequestInfo>,
    /// Worker of each open window.
    pub open_windows: Vec<WorkerId>,
    pub workers: Vec<WorkerDiag>,
    pub running: Vec<RunningJob>,
}
