//! Task scheduler for a sector sealing pipeline.
//!
//! Callers submit sealing tasks (add piece, pre-commit, commit, ...) together
//! with a [`selector::WorkerSelector`]; workers offer scheduling windows of
//! spare capacity; a single control loop matches the two using a pluggable
//! [`scheduler::Assigner`] and hands the work to the worker's session, which
//! runs it in two resource-accounted phases.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod index;
pub mod resources;
pub mod scheduler;
pub mod sector;
pub mod selector;
pub mod shutdown;
pub mod worker;

pub use config::{AssignerKind, SchedulerConfig};
pub use error::{Result, SchedError};
pub use scheduler::{SchedContext, Scheduler};
