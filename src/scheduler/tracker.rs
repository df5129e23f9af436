use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sector::{SectorId, TaskType};
use crate::worker::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStage {
    Preparing,
    Running,
}

/// A task a worker has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningJob {
    pub sched_id: Uuid,
    pub worker: WorkerId,
    pub sector: SectorId,
    pub task_type: TaskType,
    pub stage: WorkStage,
    pub started_at: DateTime<Utc>,
}

/// Tasks currently executing on any worker.
#[derive(Debug, Default)]
pub struct WorkTracker {
    running: Mutex<HashMap<Uuid, RunningJob>>,
}

impl WorkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, sched_id: Uuid, worker: WorkerId, sector: SectorId, task_type: TaskType) {
        let job = RunningJob {
            sched_id,
            worker,
            sector,
            task_type,
            stage: WorkStage::Preparing,
            started_at: Utc::now(),
        };
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sched_id, job);
    }

    pub fn set_stage(&self, sched_id: Uuid, stage: WorkStage) {
        if let Some(job) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&sched_id)
        {
            job.stage = stage;
        }
    }

    pub fn finish(&self, sched_id: Uuid) -> Option<RunningJob> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sched_id)
    }

    /// Snapshot, oldest first.
    pub fn running(&self) -> Vec<RunningJob> {
        let mut jobs: Vec<RunningJob> = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    pub fn running_on(&self, worker: WorkerId) -> usize {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|j| j.worker == worker)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_job_through_stages() {
        let tracker = WorkTracker::new();
        let worker = WorkerId(Uuid::new_v4());
        let id = Uuid::new_v4();

        tracker.start(id, worker, SectorId::new(1000, 1), TaskType::PreCommit1);
        assert_eq!(tracker.running_on(worker), 1);
        assert_eq!(tracker.running()[0].stage, WorkStage::Preparing);

        tracker.set_stage(id, WorkStage::Running);
        assert_eq!(tracker.running()[0].stage, WorkStage::Running);

        let done = tracker.finish(id).unwrap();
        assert_eq!(done.task_type, TaskType::PreCommit1);
        assert!(tracker.running().is_empty());
        assert!(tracker.finish(id).is_none());
    }
}
