use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::index::SectorIndex;
use crate::sector::{PathType, RegisteredSealProof, SectorFileType, TaskType};
use crate::selector::{less_utilized, supports, Eligibility, WorkerSelector};
use crate::worker::WorkerHandle;

/// Workers with a local path where new sector files can be allocated.
pub struct AllocSelector {
    index: Arc<dyn SectorIndex>,
    alloc: Vec<SectorFileType>,
    path_type: PathType,
}

impl AllocSelector {
    pub fn new(index: Arc<dyn SectorIndex>, alloc: Vec<SectorFileType>, path_type: PathType) -> Self {
        Self {
            index,
            alloc,
            path_type,
        }
    }
}

#[async_trait]
impl WorkerSelector for AllocSelector {
    async fn ok(
        &self,
        task: TaskType,
        proof: RegisteredSealProof,
        worker: &WorkerHandle,
    ) -> Result<Eligibility> {
        if !supports(task, proof, worker).await {
            return Ok(Eligibility::rejected());
        }

        let local: HashSet<_> = worker.paths().await?.into_iter().map(|p| p.id).collect();

        for file_type in &self.alloc {
            let candidates = self
                .index
                .storage_best_alloc(*file_type, proof.sector_size(), self.path_type)
                .await?;
            if !candidates.iter().any(|info| local.contains(&info.id)) {
                return Ok(Eligibility::rejected());
            }
        }

        Ok(Eligibility::eligible())
    }

    async fn cmp(&self, _task: TaskType, a: &WorkerHandle, b: &WorkerHandle) -> Result<bool> {
        Ok(less_utilized(a, b))
    }
}
