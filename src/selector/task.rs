use async_trait::async_trait;

use crate::error::Result;
use crate::sector::{RegisteredSealProof, TaskType};
use crate::selector::{less_utilized, supports, Eligibility, WorkerSelector};
use crate::worker::WorkerHandle;

/// Any worker supporting the task type; specialised workers first.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskSelector;

impl TaskSelector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkerSelector for TaskSelector {
    async fn ok(
        &self,
        task: TaskType,
        proof: RegisteredSealProof,
        worker: &WorkerHandle,
    ) -> Result<Eligibility> {
        if supports(task, proof, worker).await {
            Ok(Eligibility::eligible())
        } else {
            Ok(Eligibility::rejected())
        }
    }

    async fn cmp(&self, _task: TaskType, a: &WorkerHandle, b: &WorkerHandle) -> Result<bool> {
        let a_tasks = a.task_types().await.len();
        let b_tasks = b.task_types().await.len();
        if a_tasks != b_tasks {
            // keep generalists free for tasks nobody else can run
            return Ok(a_tasks < b_tasks);
        }

        Ok(less_utilized(a, b))
    }
}
