use thiserror::Error;
use uuid::Uuid;

use crate::worker::WorkerId;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("scheduler is closing")]
    Closing,

    #[error("request cancelled")]
    Cancelled,

    #[error("scheduling request removed")]
    RequestRemoved,

    #[error("no request with id {0} in the queue")]
    RequestNotFound(Uuid),

    #[error("request {0} is already queued")]
    DuplicateRequest(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Worker already registered: {0}")]
    WorkerAlreadyRegistered(WorkerId),

    #[error("unknown assigner '{0}'")]
    UnknownAssigner(String),

    #[error("selector call timed out")]
    SelectorTimeout,

    #[error("selector error: {0}")]
    Selector(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("sector index error: {0}")]
    Index(String),

    #[error("response channel dropped before a reply was sent")]
    ResponseDropped,
}

pub type Result<T> = std::result::Result<T, SchedError>;
