//! Worker selection policies.
//!
//! A selector answers two questions for one task: can this worker run it
//! (and is it *the* place to run it), and which of two workers is better.
//! A preferred worker wins against every non-preferred one; among workers of
//! the same kind the order comes from [`WorkerSelector::cmp`].

use async_trait::async_trait;

use crate::error::Result;
use crate::sector::{RegisteredSealProof, SealTaskType, TaskType};
use crate::worker::WorkerHandle;

pub mod affinity;
pub mod alloc;
pub mod existing;
pub mod task;

pub use affinity::{AffinitySelector, SectorAffinity};
pub use alloc::AllocSelector;
pub use existing::ExistingSelector;
pub use task::TaskSelector;

/// Answer of [`WorkerSelector::ok`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Eligibility {
    pub eligible: bool,
    /// Hard match, e.g. the input data is already on this worker.
    pub preferred: bool,
}

impl Eligibility {
    pub fn rejected() -> Self {
        Self::default()
    }

    pub fn eligible() -> Self {
        Self {
            eligible: true,
            preferred: false,
        }
    }

    pub fn preferred() -> Self {
        Self {
            eligible: true,
            preferred: true,
        }
    }
}

#[async_trait]
pub trait WorkerSelector: Send + Sync {
    async fn ok(
        &self,
        task: TaskType,
        proof: RegisteredSealProof,
        worker: &WorkerHandle,
    ) -> Result<Eligibility>;

    /// True if `a` should be used before `b`.
    async fn cmp(&self, task: TaskType, a: &WorkerHandle, b: &WorkerHandle) -> Result<bool>;
}

/// Static capability check shared by every selector: task type, proof and
/// whether the task fits on the idle worker at all.
pub async fn supports(task: TaskType, proof: RegisteredSealProof, worker: &WorkerHandle) -> bool {
    let info = worker.info();
    if !info.supports_proof(proof) {
        return false;
    }

    let need = info.resources.spec(SealTaskType {
        task_type: task,
        proof,
    });
    if !info.resources.can_ever_handle(&need) {
        return false;
    }

    worker.task_types().await.contains(&task)
}

/// The less utilized worker first.
pub fn less_utilized(a: &WorkerHandle, b: &WorkerHandle) -> bool {
    a.utilization() < b.utilization()
}
