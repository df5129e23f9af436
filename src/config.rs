use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedError;

/// Assignment policy used by the scheduler on every pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignerKind {
    /// Put each request where the resulting worker utilization is lowest.
    #[default]
    Utilization,
    /// Put each request on the worker running the fewest tasks of its type.
    Spread,
}

impl FromStr for AssignerKind {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "utilization" => Ok(AssignerKind::Utilization),
            "spread" => Ok(AssignerKind::Spread),
            other => Err(SchedError::UnknownAssigner(other.to_string())),
        }
    }
}

impl fmt::Display for AssignerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignerKind::Utilization => write!(f, "utilization"),
            AssignerKind::Spread => write!(f, "spread"),
        }
    }
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub assigner: AssignerKind,
    /// Grace period after start during which work queues up but nothing is assigned.
    pub init_wait_ms: u64,
    /// Upper bound on a single selector `ok`/`cmp` call.
    pub selector_timeout_ms: u64,
    /// Number of scheduling windows each enabled worker keeps open.
    pub sched_windows: usize,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Age after which a worker's cached task types are fetched again.
    pub task_cache_ttl_ms: u64,
    /// How long close waits for each worker session to stop.
    pub cleanup_timeout_ms: u64,
    /// Capacity of the control loop mailbox.
    pub mailbox_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            assigner: AssignerKind::Utilization,
            init_wait_ms: 3000,
            selector_timeout_ms: 5000,
            sched_windows: 2,
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 2000,
            task_cache_ttl_ms: 10_000,
            cleanup_timeout_ms: 1000,
            mailbox_size: 64,
        }
    }
}

impl SchedulerConfig {
    pub fn with_assigner(mut self, assigner: AssignerKind) -> Self {
        self.assigner = assigner;
        self
    }

    pub fn with_init_wait_ms(mut self, ms: u64) -> Self {
        self.init_wait_ms = ms;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_sched_windows(mut self, windows: usize) -> Self {
        self.sched_windows = windows.max(1);
        self
    }

    pub fn init_wait(&self) -> Duration {
        Duration::from_millis(self.init_wait_ms)
    }

    pub fn selector_timeout(&self) -> Duration {
        Duration::from_millis(self.selector_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn task_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.task_cache_ttl_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}
