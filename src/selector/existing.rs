use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::index::SectorIndex;
use crate::sector::{RegisteredSealProof, SectorFileType, SectorId, TaskType};
use crate::selector::{less_utilized, supports, Eligibility, WorkerSelector};
use crate::worker::WorkerHandle;

/// Workers that already hold a sector file locally.
///
/// A worker with a local copy is preferred. With `allow_fetch`, workers that
/// could fetch the file into one of their sealing paths are eligible too.
pub struct ExistingSelector {
    index: Arc<dyn SectorIndex>,
    sector: SectorId,
    file_type: SectorFileType,
    allow_fetch: bool,
}

impl ExistingSelector {
    pub fn new(
        index: Arc<dyn SectorIndex>,
        sector: SectorId,
        file_type: SectorFileType,
        allow_fetch: bool,
    ) -> Self {
        Self {
            index,
            sector,
            file_type,
            allow_fetch,
        }
    }
}

#[async_trait]
impl WorkerSelector for ExistingSelector {
    async fn ok(
        &self,
        task: TaskType,
        proof: RegisteredSealProof,
        worker: &WorkerHandle,
    ) -> Result<Eligibility> {
        if !supports(task, proof, worker).await {
            return Ok(Eligibility::rejected());
        }

        let found = self
            .index
            .storage_find_sector(self.sector, self.file_type, proof.sector_size(), self.allow_fetch)
            .await?;
        let weights: HashMap<_, _> = found.into_iter().map(|info| (info.id, info.weight)).collect();

        let mut result = Eligibility::rejected();
        for path in worker.paths().await? {
            match weights.get(&path.id) {
                Some(weight) if *weight != 0 => return Ok(Eligibility::preferred()),
                Some(_) => result = Eligibility::eligible(),
                None => {}
            }
        }

        Ok(result)
    }

    async fn cmp(&self, _task: TaskType, a: &WorkerHandle, b: &WorkerHandle) -> Result<bool> {
        Ok(less_utilized(a, b))
    }
}
