//! Resource requirements, declared worker capacity and the accumulators
//! that track what is in use on a worker.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::sector::{SealTaskType, TaskType};

const GPU_EPSILON: f64 = 1e-9;

/// What one task needs while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU threads. 0 means the task uses every core of the worker.
    pub threads: u32,
    pub min_memory: u64,
    pub max_memory: u64,
    /// Share of one GPU (1.0 = a whole device).
    pub gpu: f64,
    /// Scratch bytes on the sealing path.
    pub scratch: u64,
}

impl Resources {
    /// Default requirements for a task, scaled from the proof's sector size.
    pub fn for_task(task: SealTaskType) -> Self {
        let ssize = task.proof.sector_size();
        let frac = |num: u64, den: u64| ssize / den * num;

        match task.task_type {
            TaskType::AddPiece => Self {
                threads: 1,
                min_memory: frac(1, 8),
                max_memory: frac(1, 8),
                gpu: 0.0,
                scratch: ssize,
            },
            TaskType::PreCommit1 => Self {
                threads: 1,
                min_memory: frac(7, 4),
                max_memory: frac(2, 1),
                gpu: 0.0,
                scratch: frac(11, 1),
            },
            TaskType::PreCommit2 => Self {
                threads: 0,
                min_memory: ssize,
                max_memory: ssize,
                gpu: 1.0,
                scratch: ssize,
            },
            TaskType::Commit1 => Self {
                threads: 1,
                min_memory: frac(1, 32),
                max_memory: frac(1, 32),
                gpu: 0.0,
                scratch: 0,
            },
            TaskType::Commit2 => Self {
                threads: 0,
                min_memory: frac(2, 1),
                max_memory: frac(6, 1),
                gpu: 1.0,
                scratch: 0,
            },
            TaskType::Finalize => Self {
                threads: 1,
                min_memory: frac(1, 32),
                max_memory: frac(1, 32),
                gpu: 0.0,
                scratch: 0,
            },
            TaskType::Fetch => Self {
                threads: 1,
                min_memory: 1 << 20,
                max_memory: 1 << 20,
                gpu: 0.0,
                scratch: ssize,
            },
            TaskType::Unseal => Self {
                threads: 1,
                min_memory: frac(7, 4),
                max_memory: frac(2, 1),
                gpu: 0.0,
                scratch: frac(12, 1),
            },
        }
    }

    /// Threads actually taken on a worker with `cpus` cores.
    pub fn threads(&self, cpus: u32) -> u32 {
        if self.threads == 0 || self.threads > cpus {
            cpus
        } else {
            self.threads
        }
    }
}

/// Capacity a worker declares when it registers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerResources {
    pub memory_physical: u64,
    pub memory_swap: u64,
    /// Memory used by things other than sealing tasks.
    pub memory_reserved: u64,
    pub cpus: u32,
    pub gpus: Vec<String>,
    pub scratch_space: u64,
    /// Per task type replacements for the default requirement table.
    #[serde(skip)]
    pub overrides: HashMap<TaskType, Resources>,
}

impl WorkerResources {
    pub fn with_override(mut self, task: TaskType, res: Resources) -> Self {
        self.overrides.insert(task, res);
        self
    }

    /// Requirement of `task` when run on this worker.
    pub fn spec(&self, task: SealTaskType) -> Resources {
        self.overrides
            .get(&task.task_type)
            .copied()
            .unwrap_or_else(|| Resources::for_task(task))
    }

    /// Whether `need` would fit on this worker when it is completely idle.
    pub fn can_ever_handle(&self, need: &Resources) -> bool {
        ActiveResources::default().can_handle(need, self)
    }
}

/// Resources currently accounted to tasks on one worker (or planned into one window).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveResources {
    pub cpu_use: u32,
    pub mem_used_min: u64,
    pub mem_used_max: u64,
    pub gpu_used: f64,
    pub scratch_used: u64,
    pub tasks: BTreeMap<TaskType, usize>,
}

impl ActiveResources {
    /// Whether `need` fits on top of what is already accounted here.
    pub fn can_handle(&self, need: &Resources, res: &WorkerResources) -> bool {
        let threads = need.threads(res.cpus) as u64;
        if self.cpu_use as u64 + threads > res.cpus as u64 {
            return false;
        }

        let min_needed = self.mem_used_min as u128 + need.min_memory as u128 + res.memory_reserved as u128;
        if min_needed > res.memory_physical as u128 {
            return false;
        }

        let max_needed = self.mem_used_max as u128 + need.max_memory as u128 + res.memory_reserved as u128;
        if max_needed > res.memory_physical as u128 + res.memory_swap as u128 {
            return false;
        }

        if need.gpu > 0.0 && self.gpu_used + need.gpu > res.gpus.len() as f64 + GPU_EPSILON {
            return false;
        }

        self.scratch_used as u128 + need.scratch as u128 <= res.scratch_space as u128
    }

    pub fn add(&mut self, task: TaskType, need: &Resources, res: &WorkerResources) {
        self.cpu_use += need.threads(res.cpus);
        self.mem_used_min += need.min_memory;
        self.mem_used_max += need.max_memory;
        self.gpu_used += need.gpu;
        self.scratch_used += need.scratch;
        *self.tasks.entry(task).or_insert(0) += 1;
    }

    /// Release what [`add`](Self::add) accounted.
    ///
    /// # Panics
    ///
    /// Panics when releasing more than is accounted. That only happens when a
    /// reservation is released twice, and continuing would corrupt every later
    /// scheduling decision for the worker.
    pub fn free(&mut self, task: TaskType, need: &Resources, res: &WorkerResources) {
        let threads = need.threads(res.cpus);
        let in_use = self.cpu_use;
        self.cpu_use = in_use
            .checked_sub(threads)
            .unwrap_or_else(|| panic!("cpu accounting underflow freeing {} ({} threads in use)", task, in_use));
        self.mem_used_min = self
            .mem_used_min
            .checked_sub(need.min_memory)
            .unwrap_or_else(|| panic!("min memory accounting underflow freeing {}", task));
        self.mem_used_max = self
            .mem_used_max
            .checked_sub(need.max_memory)
            .unwrap_or_else(|| panic!("max memory accounting underflow freeing {}", task));
        self.scratch_used = self
            .scratch_used
            .checked_sub(need.scratch)
            .unwrap_or_else(|| panic!("scratch accounting underflow freeing {}", task));
        assert!(
            self.gpu_used + GPU_EPSILON >= need.gpu,
            "gpu accounting underflow freeing {}",
            task
        );
        self.gpu_used = (self.gpu_used - need.gpu).max(0.0);

        match self.tasks.get_mut(&task) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.tasks.remove(&task);
            }
            None => panic!("task count underflow freeing {}", task),
        }
    }

    /// Sum of two accumulators, e.g. `preparing` and `active`.
    pub fn combined(&self, other: &ActiveResources) -> ActiveResources {
        let mut tasks = self.tasks.clone();
        for (task, count) in &other.tasks {
            *tasks.entry(*task).or_insert(0) += count;
        }
        ActiveResources {
            cpu_use: self.cpu_use + other.cpu_use,
            mem_used_min: self.mem_used_min + other.mem_used_min,
            mem_used_max: self.mem_used_max + other.mem_used_max,
            gpu_used: self.gpu_used + other.gpu_used,
            scratch_used: self.scratch_used + other.scratch_used,
            tasks,
        }
    }

    /// Whether the accounted usage is within the worker's declared capacity.
    pub fn within(&self, res: &WorkerResources) -> bool {
        self.cpu_use <= res.cpus
            && self.mem_used_min as u128 + res.memory_reserved as u128 <= res.memory_physical as u128
            && self.mem_used_max as u128 + res.memory_reserved as u128
                <= res.memory_physical as u128 + res.memory_swap as u128
            && self.gpu_used <= res.gpus.len() as f64 + GPU_EPSILON
            && self.scratch_used <= res.scratch_space
    }

    /// Highest usage ratio over all resource axes, in `0.0..=1.0` when within capacity.
    pub fn utilization(&self, res: &WorkerResources) -> f64 {
        let mut max: f64 = 0.0;

        if res.cpus > 0 {
            max = max.max(self.cpu_use as f64 / res.cpus as f64);
        }
        if res.memory_physical > 0 {
            let used = (self.mem_used_min + res.memory_reserved) as f64;
            max = max.max(used / res.memory_physical as f64);
        }
        let virt = res.memory_physical + res.memory_swap;
        if virt > 0 {
            let used = (self.mem_used_max + res.memory_reserved) as f64;
            max = max.max(used / virt as f64);
        }
        if !res.gpus.is_empty() {
            max = max.max(self.gpu_used / res.gpus.len() as f64);
        }
        if res.scratch_space > 0 {
            max = max.max(self.scratch_used as f64 / res.scratch_space as f64);
        }

        max
    }

    pub fn task_count(&self, task: TaskType) -> usize {
        self.tasks.get(&task).copied().unwrap_or(0)
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
