use std::time::Duration;

use async_trait::async_trait;

use crate::resources::{ActiveResources, Resources};
use crate::scheduler::assigner::{schedule_pass, Assigner, Placement};
use crate::scheduler::control::SchedState;
use crate::scheduler::WorkerTable;
use crate::sector::TaskType;
use crate::worker::WorkerHandle;

/// Places each request on the worker running the fewest tasks of its type.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadAssigner;

impl Placement for SpreadAssigner {
    fn score(&self, task: TaskType, _need: &Resources, _worker: &WorkerHandle, usage: &ActiveResources) -> f64 {
        usage.task_count(task) as f64
    }
}

#[async_trait]
impl Assigner for SpreadAssigner {
    fn name(&self) -> &'static str {
        "spread"
    }

    async fn try_sched(&self, state: &mut SchedState, workers: &WorkerTable, selector_timeout: Duration) -> usize {
        schedule_pass(state, workers, selector_timeout, self).await
    }
}
