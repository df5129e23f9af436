use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Result, SchedError};
use crate::resources::WorkerResources;
use crate::sector::{RegisteredSealProof, TaskType};
use crate::worker::{StoragePath, Worker, WorkerInfo};

/// Worker living in the scheduler's own process.
///
/// It runs nothing by itself: task actions receive it and do their work
/// directly. Health and restarts can be simulated.
#[derive(Debug)]
pub struct LocalWorker {
    hostname: String,
    resources: WorkerResources,
    proofs: Vec<RegisteredSealProof>,
    task_types: Mutex<HashSet<TaskType>>,
    paths: Vec<StoragePath>,
    session: Mutex<Uuid>,
    healthy: AtomicBool,
}

impl LocalWorker {
    pub fn new(hostname: impl Into<String>, resources: WorkerResources) -> Self {
        Self {
            hostname: hostname.into(),
            resources,
            proofs: Vec::new(),
            task_types: Mutex::new(TaskType::ALL.into_iter().collect()),
            paths: Vec::new(),
            session: Mutex::new(Uuid::new_v4()),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn with_task_types(self, tasks: impl IntoIterator<Item = TaskType>) -> Self {
        self.set_task_types(tasks);
        self
    }

    pub fn with_paths(mut self, paths: Vec<StoragePath>) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_proofs(mut self, proofs: Vec<RegisteredSealProof>) -> Self {
        self.proofs = proofs;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn worker_info(&self) -> WorkerInfo {
        WorkerInfo {
            hostname: self.hostname.clone(),
            resources: self.resources.clone(),
            proofs: self.proofs.clone(),
        }
    }

    pub fn set_task_types(&self, tasks: impl IntoIterator<Item = TaskType>) {
        *self
            .task_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = tasks.into_iter().collect();
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Simulate a process restart. Returns the new session id.
    pub fn restart(&self) -> Uuid {
        let session = Uuid::new_v4();
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
        session
    }

    fn check_healthy(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SchedError::Worker(format!("{} is unreachable", self.hostname)))
        }
    }
}

#[async_trait]
impl Worker for LocalWorker {
    async fn info(&self) -> Result<WorkerInfo> {
        self.check_healthy()?;
        Ok(self.worker_info())
    }

    async fn task_types(&self) -> Result<HashSet<TaskType>> {
        self.check_healthy()?;
        Ok(self
            .task_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn paths(&self) -> Result<Vec<StoragePath>> {
        self.check_healthy()?;
        Ok(self.paths.clone())
    }

    async fn session(&self) -> Result<Uuid> {
        self.check_healthy()?;
        Ok(*self.session.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
