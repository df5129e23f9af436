//! Assignment policies.
//!
//! A pass walks the queue in dispatch order and, for each request, picks one
//! open window among the eligible workers. The pass only plans: nothing is
//! taken out of the queue until every request has been considered, so an
//! aborted pass leaves the queue as it was.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::AssignerKind;
use crate::error::{Result, SchedError};
use crate::resources::{ActiveResources, Resources};
use crate::scheduler::control::SchedState;
use crate::scheduler::request::{SchedWindow, WorkerRequest};
use crate::scheduler::WorkerTable;
use crate::sector::TaskType;
use crate::worker::{WorkerHandle, WorkerId};

mod spread;
mod utilization;

pub use spread::SpreadAssigner;
pub use utilization::UtilizationAssigner;

#[async_trait]
pub trait Assigner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one pass over the queue and the open windows. Returns the number
    /// of requests handed to workers.
    async fn try_sched(&self, state: &mut SchedState, workers: &WorkerTable, selector_timeout: Duration) -> usize;
}

pub fn new_assigner(kind: AssignerKind) -> Box<dyn Assigner> {
    match kind {
        AssignerKind::Utilization => Box::new(UtilizationAssigner),
        AssignerKind::Spread => Box::new(SpreadAssigner),
    }
}

/// Scores a tentative placement. Lower is better; equal scores keep the
/// selector's ranking.
pub(crate) trait Placement: Send + Sync {
    fn score(&self, task: TaskType, need: &Resources, worker: &WorkerHandle, usage: &ActiveResources) -> f64;
}

/// One planned assignment: request id to open window index.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Assignment {
    pub sched_id: Uuid,
    pub window: usize,
}

/// Planned placements plus the resources each open window would carry.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub assignments: Vec<Assignment>,
    pub allocated: Vec<ActiveResources>,
}

/// Plan the whole pass, then commit it.
pub(crate) async fn schedule_pass(
    state: &mut SchedState,
    workers: &WorkerTable,
    selector_timeout: Duration,
    policy: &dyn Placement,
) -> usize {
    let plan = plan(state, workers, selector_timeout, policy).await;
    commit(state, plan)
}

pub(crate) async fn plan(
    state: &SchedState,
    workers: &WorkerTable,
    selector_timeout: Duration,
    policy: &dyn Placement,
) -> Plan {
    let mut plan = Plan {
        assignments: Vec::new(),
        allocated: vec![ActiveResources::default(); state.open_windows.len()],
    };
    if state.queue.is_empty() || state.open_windows.is_empty() {
        return plan;
    }

    // windows grouped per worker, in the order they were offered
    let mut offered: Vec<(Arc<WorkerHandle>, Vec<usize>)> = Vec::new();
    for (i, window) in state.open_windows.iter().enumerate() {
        let Some(handle) = workers.get(&window.worker) else {
            continue;
        };
        if !handle.enabled() {
            continue;
        }
        match offered.iter_mut().find(|(h, _)| h.id == window.worker) {
            Some((_, idx)) => idx.push(i),
            None => offered.push((Arc::clone(handle), vec![i])),
        }
    }
    if offered.is_empty() {
        return plan;
    }

    let mut planned: HashMap<WorkerId, ActiveResources> = HashMap::new();

    for request in state.queue.ordered() {
        if request.is_cancelled() {
            continue;
        }

        let candidates = eligible_workers(request, &offered, selector_timeout).await;
        if candidates.is_empty() {
            tracing::trace!(sched_id = %request.sched_id, task = %request.task_type, "No eligible worker");
            continue;
        }

        let task = request.task_type;
        let mut best: Option<(f64, usize, WorkerId, Resources)> = None;

        for (handle, windows) in candidates {
            let res = &handle.info().resources;
            let need = res.spec(request.seal_task());

            let usage = match planned.get(&handle.id) {
                Some(p) => handle.usage().combined(p),
                None => handle.usage(),
            };
            if !usage.can_handle(&need, res) {
                continue;
            }

            let Some(&window) = windows.iter().find(|&&w| plan.allocated[w].can_handle(&need, res)) else {
                continue;
            };

            let score = policy.score(task, &need, &handle, &usage);
            if best.as_ref().map(|(s, ..)| score < *s).unwrap_or(true) {
                best = Some((score, window, handle.id, need));
            }
        }

        let Some((_, window, worker, need)) = best else {
            continue;
        };
        let Some((handle, _)) = offered.iter().find(|(h, _)| h.id == worker) else {
            continue;
        };
        let res = &handle.info().resources;

        plan.allocated[window].add(task, &need, res);
        planned.entry(worker).or_default().add(task, &need, res);
        plan.assignments.push(Assignment {
            sched_id: request.sched_id,
            window,
        });

        tracing::debug!(
            sched_id = %request.sched_id,
            task = %task,
            sector = %request.sector.id,
            worker = %worker,
            window,
            "Planned assignment"
        );
    }

    plan
}

/// Workers whose selector answer allows `request`, best first. Only
/// preferred workers remain when there is any.
async fn eligible_workers(
    request: &WorkerRequest,
    offered: &[(Arc<WorkerHandle>, Vec<usize>)],
    selector_timeout: Duration,
) -> Vec<(Arc<WorkerHandle>, Vec<usize>)> {
    let seal = request.seal_task();
    let mut eligible = Vec::new();
    let mut any_preferred = false;

    for (handle, windows) in offered {
        let need = handle.info().resources.spec(seal);
        if !handle.info().resources.can_ever_handle(&need) {
            continue;
        }

        match bounded(selector_timeout, request.sel.ok(seal.task_type, seal.proof, handle)).await {
            Ok(answer) if answer.eligible => {
                any_preferred |= answer.preferred;
                eligible.push((answer.preferred, Arc::clone(handle), windows.clone()));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(worker = %handle.id, sched_id = %request.sched_id, error = %e, "Selector failed, skipping worker");
            }
        }
    }

    if any_preferred {
        eligible.retain(|(preferred, ..)| *preferred);
    }

    // insertion sort; cmp is async so sort_by is not an option
    let mut ranked: Vec<(Arc<WorkerHandle>, Vec<usize>)> = Vec::with_capacity(eligible.len());
    for (_, handle, windows) in eligible {
        let mut at = ranked.len();
        while at > 0 {
            let better = match bounded(
                selector_timeout,
                request.sel.cmp(seal.task_type, &handle, &ranked[at - 1].0),
            )
            .await
            {
                Ok(better) => better,
                Err(e) => {
                    tracing::warn!(worker = %handle.id, error = %e, "Selector compare failed");
                    false
                }
            };
            if !better {
                break;
            }
            at -= 1;
        }
        ranked.insert(at, (handle, windows));
    }

    ranked
}

/// A selector call bounded by `limit`.
async fn bounded<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(limit, call).await.map_err(|_| SchedError::SelectorTimeout)?
}

/// Move planned requests into their windows and hand the windows over.
pub(crate) fn commit(state: &mut SchedState, plan: Plan) -> usize {
    if plan.assignments.is_empty() {
        return 0;
    }

    let mut filled: Vec<SchedWindow> = plan
        .allocated
        .into_iter()
        .map(|allocated| SchedWindow {
            allocated,
            todo: Vec::new(),
        })
        .collect();

    let mut assigned = 0;
    for a in &plan.assignments {
        if let Some(request) = state.queue.take(&a.sched_id) {
            filled[a.window].todo.push(request);
            assigned += 1;
        }
    }

    // back to front so earlier indices stay valid
    for i in (0..filled.len()).rev() {
        if filled[i].todo.is_empty() {
            continue;
        }
        let window = std::mem::take(&mut filled[i]);
        let request = state.open_windows.remove(i);

        if let Err(e) = request.done.try_send(window) {
            let window = match e {
                TrySendError::Full(w) | TrySendError::Closed(w) => w,
            };
            tracing::warn!(worker = %request.worker, tasks = window.todo.len(), "Worker stopped taking windows, requeueing");
            assigned -= window.todo.len();
            for req in window.todo {
                state.queue.push(req);
            }
        }
    }

    assigned
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::HashMap;
use std::future::Future;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::scheduler::control::SchedState;
    use crate::scheduler::request::{SchedWindow, SchedWindowRequest};
    use crate::scheduler::WorkerTable;
    use crate::worker::WorkerHandle;

    pub fn table(handles: &[&Arc<WorkerHandle>]) -> WorkerTable {
        handles.iter().map(|h| (h.id, Arc::clone(h))).collect::<HashMap<_, _>>()
    }

    /// Offer `n` windows for `handle`; returns the receiving end.
    pub fn offer(state: &mut SchedState, handle: &WorkerHandle, n: usize) -> mpsc::Receiver<SchedWindow> {
        let (tx, rx) = mpsc::channel(n.max(1));
        for _ in 0..n {
            state.open_windows.push(SchedWindowRequest {
                worker: handle.id,
                done: tx.clone(),
            });
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testutil::{offer, table};
    use super::*;
    use crate::scheduler::queue::testutil::request;
    use crate::selector::testutil::handle;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn single_slot_window_takes_most_urgent_request() {
        let worker = handle("w1", 1, &[]);
        let workers = table(&[&worker]);
        let mut state = SchedState::default();

        let mut ids = Vec::new();
        for (seq, priority) in [5, 1, 5].into_iter().enumerate() {
            let (req, _rx) = request(priority, seq as u64);
            ids.push(req.sched_id);
            state.queue.push(req);
        }
        let mut rx = offer(&mut state, &worker, 1);

        let n = schedule_pass(&mut state, &workers, TIMEOUT, &utilization::UtilizationAssigner).await;
        assert_eq!(n, 1);

        let window = rx.recv().await.unwrap();
        assert_eq!(window.todo.len(), 1);
        assert_eq!(window.todo[0].sched_id, ids[0]);
        assert_eq!(state.queue.len(), 2);
        assert!(state.open_windows.is_empty());
    }

    #[tokio::test]
    async fn window_is_never_overfilled() {
        let worker = handle("w1", 2, &[]);
        let workers = table(&[&worker]);
        let mut state = SchedState::default();
        for seq in 0..5 {
            state.queue.push(request(0, seq).0);
        }
        let mut rx = offer(&mut state, &worker, 1);

        schedule_pass(&mut state, &workers, TIMEOUT, &utilization::UtilizationAssigner).await;

        let window = rx.recv().await.unwrap();
        assert_eq!(window.todo.len(), 2, "two cpus, one thread per task");
        assert!(window.allocated.within(&worker.info().resources));
        assert_eq!(state.queue.len(), 3);
    }

    #[tokio::test]
    async fn disabled_worker_gets_nothing() {
        let worker = handle("w1", 2, &[]);
        worker.set_enabled(false);
        let workers = table(&[&worker]);
        let mut state = SchedState::default();
        state.queue.push(request(0, 0).0);
        let _rx = offer(&mut state, &worker, 1);

        let n = schedule_pass(&mut state, &workers, TIMEOUT, &utilization::UtilizationAssigner).await;
        assert_eq!(n, 0);
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.open_windows.len(), 1);
    }

    #[tokio::test]
    async fn closed_window_channel_requeues() {
        let worker = handle("w1", 2, &[]);
        let workers = table(&[&worker]);
        let mut state = SchedState::default();
        let (req, _reply) = request(3, 0);
        let id = req.sched_id;
        state.queue.push(req);
        drop(offer(&mut state, &worker, 1));

        let n = schedule_pass(&mut state, &workers, TIMEOUT, &utilization::UtilizationAssigner).await;
        assert_eq!(n, 0);
        assert_eq!(state.queue.get(&id).map(|r| r.priority), Some(3));
        assert!(state.open_windows.is_empty());
    }

    #[tokio::test]
    async fn cancelled_request_is_not_assigned() {
        let worker = handle("w1", 2, &[]);
        let workers = table(&[&worker]);
        let mut state = SchedState::default();
        let (req, _reply) = request(0, 0);
        req.cancel.cancel();
        state.queue.push(req);
        let _rx = offer(&mut state, &worker, 1);

        let n = schedule_pass(&mut state, &workers, TIMEOUT, &utilization::UtilizationAssigner).await;
        assert_eq!(n, 0);
        assert_eq!(state.queue.len(), 1);
    }

    #[tokio::test]
    async fn slow_selector_call_times_out() {
        let res = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        })
        .await;
        assert!(matches!(res, Err(SchedError::SelectorTimeout)));

        let res = bounded(TIMEOUT, async { Ok(false) }).await;
        assert!(matches!(res, Ok(false)));
    }
}
