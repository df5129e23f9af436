//! Workers as seen by the scheduler.
//!
//! A worker is an external process that runs sealing tasks. The scheduler
//! only needs a small capability set from it:
//! - **Capabilities**: supported task types, local storage paths, declared resources
//! - **Session**: an id that changes when the worker restarts, used as heartbeat
//!
//! # Components
//!
//! - [`Worker`]: the capability trait a transport layer implements
//! - [`WorkerHandle`]: scheduler-side state of one connected worker
//! - [`session`]: per-worker task requesting windows and running assigned work
//! - [`heartbeat`]: health probing of a worker session
//! - [`LocalWorker`]: in-process worker, used by the demo binary and tests
//!
//! # Execution Flow
//!
//! 1. The session keeps scheduling windows open with the scheduler
//! 2. The scheduler fills a window and hands it to the session
//! 3. The session reserves resources and runs `prepare`, then `work`
//! 4. Resources are released and the scheduler is told capacity changed

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::index::StorageId;
use crate::resources::WorkerResources;
use crate::sector::{RegisteredSealProof, TaskType};

pub mod handle;
pub mod heartbeat;
pub mod local;
pub(crate) mod session;

pub use handle::WorkerHandle;
pub use local::LocalWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub hostname: String,
    pub resources: WorkerResources,
    /// Proof variants the worker can seal. Empty means all of them.
    pub proofs: Vec<RegisteredSealProof>,
}

impl WorkerInfo {
    pub fn supports_proof(&self, proof: RegisteredSealProof) -> bool {
        self.proofs.is_empty() || self.proofs.contains(&proof)
    }
}

/// A storage path local to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePath {
    pub id: StorageId,
    pub weight: u64,
    pub local_path: PathBuf,
    pub can_seal: bool,
    pub can_store: bool,
}

#[async_trait]
pub trait Worker: Send + Sync {
    async fn info(&self) -> Result<WorkerInfo>;

    async fn task_types(&self) -> Result<HashSet<TaskType>>;

    async fn paths(&self) -> Result<Vec<StoragePath>>;

    /// Current session id. A different id means the worker restarted.
    async fn session(&self) -> Result<Uuid>;
}

/// One phase of a task, run against the worker it was assigned to.
pub type WorkerAction = Box<dyn FnOnce(Arc<dyn Worker>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`WorkerAction`].
pub fn action<F, Fut>(f: F) -> WorkerAction
where
    F: FnOnce(Arc<dyn Worker>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |worker| f(worker).boxed())
}

/// An action that does nothing; for tasks without a staging phase.
pub fn noop_action() -> WorkerAction {
    action(|_| async { Ok(()) })
}
