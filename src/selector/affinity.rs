use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::sector::{RegisteredSealProof, SectorId, TaskType};
use crate::selector::{Eligibility, WorkerSelector};
use crate::worker::WorkerHandle;

/// Which worker host a sector's in-progress files live on.
///
/// The worker session records the host each time a task for the sector
/// starts, so later stages can follow the data.
#[derive(Debug, Default)]
pub struct SectorAffinity {
    hosts: RwLock<HashMap<SectorId, String>>,
}

impl SectorAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sector: SectorId, hostname: &str) {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        if hosts.get(&sector).map(String::as_str) != Some(hostname) {
            tracing::debug!(sector = %sector, hostname, "Sector bound to worker host");
            hosts.insert(sector, hostname.to_string());
        }
    }

    pub fn lookup(&self, sector: SectorId) -> Option<String> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sector)
            .cloned()
    }

    pub fn forget(&self, sector: SectorId) {
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sector);
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Prefers the host that already worked on a sector. Other workers keep the
/// answer of `inner`, so a stage the home host cannot run still goes elsewhere.
pub struct AffinitySelector {
    affinity: Arc<SectorAffinity>,
    sector: SectorId,
    inner: Arc<dyn WorkerSelector>,
}

impl AffinitySelector {
    pub fn new(affinity: Arc<SectorAffinity>, sector: SectorId, inner: Arc<dyn WorkerSelector>) -> Self {
        Self {
            affinity,
            sector,
            inner,
        }
    }
}

#[async_trait]
impl WorkerSelector for AffinitySelector {
    async fn ok(
        &self,
        task: TaskType,
        proof: RegisteredSealProof,
        worker: &WorkerHandle,
    ) -> Result<Eligibility> {
        let inner = self.inner.ok(task, proof, worker).await?;

        match self.affinity.lookup(self.sector) {
            Some(host) if inner.eligible && host == worker.info().hostname => Ok(Eligibility::preferred()),
            _ => Ok(inner),
        }
    }

    async fn cmp(&self, task: TaskType, a: &WorkerHandle, b: &WorkerHandle) -> Result<bool> {
        self.inner.cmp(task, a, b).await
    }
}
