//! The scheduler: decides which worker runs which sealing task, and when.
//!
//! # Architecture
//!
//! - **Control loop** ([`SchedLoop`]): the only owner of the request queue and
//!   the open windows. Every change arrives as a message on one mailbox and is
//!   applied in order; after a burst of messages one assignment pass runs.
//! - **Handle** ([`Scheduler`]): cheap to clone, used by callers to submit
//!   tasks, remove requests, read diagnostics and manage workers.
//! - **Assigners** ([`assigner`]): plan a pass over the queue and commit it
//!   into the open windows.
//!
//! # Lifecycle
//!
//! ```text
//! uninitialized --(init wait)--> running --(close)--> closing --> closed
//! ```
//!
//! Requests queue up while uninitialized but nothing is assigned until the
//! first pass after the init wait.

use std::collections::HashMap;
use std::sync::Arc;

use crate::worker::{WorkerHandle, WorkerId};

pub mod assigner;
pub(crate) mod control;
pub mod diag;
pub mod queue;
pub mod request;
mod sched;
pub mod tracker;

pub use assigner::{Assigner, SpreadAssigner, UtilizationAssigner};
pub use control::{SchedLoop, SchedState};
pub use diag::{SchedDiagInfo, SchedDiagRequestInfo, WorkerDiag};
pub use queue::RequestQueue;
pub use request::{SchedContext, SchedWindow, SchedWindowRequest, WorkerRequest, DEFAULT_SCHED_PRIORITY};
pub use sched::Scheduler;
pub use tracker::{RunningJob, WorkStage, WorkTracker};

/// Connected workers by id.
pub type WorkerTable = HashMap<WorkerId, Arc<WorkerHandle>>;
