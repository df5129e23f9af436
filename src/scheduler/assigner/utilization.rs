use std::time::Duration;

use async_trait::async_trait;

use crate::resources::{ActiveResources, Resources};
use crate::scheduler::assigner::{schedule_pass, Assigner, Placement};
use crate::scheduler::control::SchedState;
use crate::scheduler::WorkerTable;
use crate::sector::TaskType;
use crate::worker::WorkerHandle;

/// Places each request where the worker's utilization after taking it is lowest.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtilizationAssigner;

impl Placement for UtilizationAssigner {
    fn score(&self, task: TaskType, need: &Resources, worker: &WorkerHandle, usage: &ActiveResources) -> f64 {
        let res = &worker.info().resources;
        let mut after = usage.clone();
        after.add(task, need, res);
        after.utilization(res)
    }
}

#[async_trait]
impl Assigner for UtilizationAssigner {
    fn name(&self) -> &'static str {
        "utilization"
    }

    async fn try_sched(&self, state: &mut SchedState, workers: &WorkerTable, selector_timeout: Duration) -> usize {
        schedule_pass(state, workers, selector_timeout, self).await
    }
}
