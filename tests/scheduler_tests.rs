
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sealing_scheduler::config::SchedulerConfig;
use sealing_scheduler::error::{Result, SchedError};
use sealing_scheduler::scheduler::{SchedContext, Scheduler};
use sealing_scheduler::sector::{RegisteredSealProof, TaskType};
use sealing_scheduler::selector::{Eligibility, TaskSelector, WorkerSelector};
use sealing_scheduler::worker::{action, noop_action, LocalWorker, StoragePath, Worker, WorkerHandle, WorkerInfo};
use test_harness::{
    assert_eventually, gated, queued, record, resources, sector, test_config, Concurrency,
};

fn task_selector() -> Arc<dyn WorkerSelector> {
    Arc::new(TaskSelector::new())
}

#[tokio::test]
async fn test_priority_then_submission_order_on_single_slot() {
    let (sched, _loop) = Scheduler::start(test_config(300).with_sched_windows(1));
    sched
        .register_worker(Arc::new(LocalWorker::new("w1", resources(1))))
        .await
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut calls = Vec::new();
    for (label, priority) in [(1u64, 5), (2, 1), (3, 5)] {
        let sched_c = sched.clone();
        let work = record(&log, label);
        calls.push(tokio::spawn(async move {
            let ctx = SchedContext::new().with_priority(priority);
            sched_c
                .schedule(&ctx, sector(label), TaskType::AddPiece, task_selector(), noop_action(), work)
                .await
        }));
        // admit one at a time so submission order is fixed
        let want = label as usize;
        assert_eventually(
            || async { queued(&sched).await == want },
            Duration::from_secs(1),
            "request should be queued",
        )
        .await;
    }

    for call in calls {
        call.await.unwrap().unwrap();
    }
    assert_eq!(*log.lock().unwrap(), vec![1, 3, 2]);

    sched.close().await;
}

#[tokio::test]
async fn test_cancel_without_workers_leaves_empty_queue() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    let token = CancellationToken::new();
    let ctx = SchedContext::with_cancel(token.clone());

    let sched_c = sched.clone();
    let call = tokio::spawn(async move {
        sched_c
            .schedule(&ctx, sector(1), TaskType::AddPiece, task_selector(), noop_action(), noop_action())
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queued(&sched).await, 1);
    token.cancel();

    let res = tokio::time::timeout(Duration::from_secs(1), call).await.unwrap().unwrap();
    assert!(matches!(res, Err(SchedError::Cancelled)));
    assert_eq!(queued(&sched).await, 0);

    sched.close().await;
}

#[tokio::test]
async fn test_cancelled_before_admission() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    let ctx = SchedContext::new();
    ctx.cancel();

    let res = sched
        .schedule(&ctx, sector(1), TaskType::AddPiece, task_selector(), noop_action(), noop_action())
        .await;
    assert!(matches!(res, Err(SchedError::Cancelled)));
    assert_eq!(queued(&sched).await, 0);

    sched.close().await;
}

#[tokio::test]
async fn test_remove_request_twice() {
    let (sched, _loop) = Scheduler::start(test_config(10));

    let sched_c = sched.clone();
    let call = tokio::spawn(async move {
        sched_c
            .schedule(
                &SchedContext::new(),
                sector(1),
                TaskType::AddPiece,
                task_selector(),
                noop_action(),
                noop_action(),
            )
            .await
    });
    assert_eventually(
        || async { queued(&sched).await == 1 },
        Duration::from_secs(1),
        "request should be queued",
    )
    .await;

    let info = sched.info(&SchedContext::new()).await.unwrap();
    let id = info.requests[0].sched_id;

    sched.remove_request(&SchedContext::new(), id).await.unwrap();
    let second = sched.remove_request(&SchedContext::new(), id).await;
    assert!(matches!(second, Err(SchedError::RequestNotFound(x)) if x == id));

    let res = call.await.unwrap();
    assert!(matches!(res, Err(SchedError::RequestRemoved)));

    sched.close().await;
}

#[tokio::test]
async fn test_nothing_assigned_before_init_wait() {
    let (sched, _loop) = Scheduler::start(test_config(400));
    sched
        .register_worker(Arc::new(LocalWorker::new("w1", resources(2))))
        .await
        .unwrap();

    let sched_c = sched.clone();
    let call = tokio::spawn(async move {
        sched_c
            .schedule(
                &SchedContext::new(),
                sector(1),
                TaskType::AddPiece,
                task_selector(),
                noop_action(),
                noop_action(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(queued(&sched).await, 1, "still in the grace period");

    tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    sched.close().await;
}

#[tokio::test]
async fn test_preparing_plus_active_stay_within_capacity() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    for host in ["w1", "w2"] {
        sched
            .register_worker(Arc::new(LocalWorker::new(host, resources(2))))
            .await
            .unwrap();
    }

    let concurrency = Concurrency::default();
    let mut calls = Vec::new();
    for n in 0..12 {
        let sched_c = sched.clone();
        let work = concurrency.work(Duration::from_millis(30));
        calls.push(tokio::spawn(async move {
            sched_c
                .schedule(&SchedContext::new(), sector(n), TaskType::AddPiece, task_selector(), noop_action(), work)
                .await
        }));
    }

    for call in calls {
        call.await.unwrap().unwrap();
    }

    let peaks = concurrency.peaks();
    assert!(!peaks.is_empty());
    for (host, peak) in peaks {
        assert!(peak <= 2, "{} ran {} tasks at once on 2 cpus", host, peak);
    }

    sched.close().await;
}

#[tokio::test]
async fn test_failing_prepare_is_reported_and_frees_resources() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    sched
        .register_worker(Arc::new(LocalWorker::new("w1", resources(1))))
        .await
        .unwrap();

    let prepare = action(|_| async {
        Err(SchedError::Worker("staging failed".to_string()))
    });
    let res = sched
        .schedule(&SchedContext::new(), sector(1), TaskType::AddPiece, task_selector(), prepare, noop_action())
        .await;
    assert!(matches!(res, Err(SchedError::Worker(ref m)) if m == "staging failed"));

    // the single slot is free again
    sched
        .schedule(&SchedContext::new(), sector(2), TaskType::AddPiece, task_selector(), noop_action(), noop_action())
        .await
        .unwrap();

    let info = sched.info(&SchedContext::new()).await.unwrap();
    assert!(info.workers[0].preparing.is_empty());
    assert!(info.workers[0].active.is_empty());
    assert!(info.running.is_empty());

    sched.close().await;
}

#[tokio::test]
async fn test_disabled_worker_gets_no_work_until_enabled() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    let id = sched
        .register_worker(Arc::new(LocalWorker::new("w1", resources(2))))
        .await
        .unwrap();
    sched.disable_worker(id).await.unwrap();

    let sched_c = sched.clone();
    let call = tokio::spawn(async move {
        sched_c
            .schedule(
                &SchedContext::new(),
                sector(1),
                TaskType::AddPiece,
                task_selector(),
                noop_action(),
                noop_action(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let info = sched.info(&SchedContext::new()).await.unwrap();
    assert_eq!(info.requests.len(), 1);
    assert!(!info.workers[0].enabled);

    sched.enable_worker(id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    sched.close().await;
}

#[tokio::test]
async fn test_disable_unknown_worker() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    let bogus = sealing_scheduler::worker::WorkerId(Uuid::new_v4());
    assert!(matches!(
        sched.disable_worker(bogus).await,
        Err(SchedError::WorkerNotFound(_))
    ));
    assert!(matches!(
        sched.enable_worker(bogus).await,
        Err(SchedError::WorkerNotFound(_))
    ));
    sched.close().await;
}

#[tokio::test]
async fn test_work_moves_to_other_worker_after_disable() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    let busy = sched
        .register_worker(Arc::new(LocalWorker::new("w1", resources(1))))
        .await
        .unwrap();

    // occupy w1
    let gate = Arc::new(Semaphore::new(0));
    let sched_c = sched.clone();
    let work = gated(&gate);
    let blocked = tokio::spawn(async move {
        sched_c
            .schedule(&SchedContext::new(), sector(1), TaskType::AddPiece, task_selector(), noop_action(), work)
            .await
    });
    assert_eventually(
        || async { sched.info(&SchedContext::new()).await.unwrap().running.len() == 1 },
        Duration::from_secs(1),
        "first task should run",
    )
    .await;

    sched.disable_worker(busy).await.unwrap();
    sched
        .register_worker(Arc::new(LocalWorker::new("w2", resources(1))))
        .await
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    sched
        .schedule(&SchedContext::new(), sector(2), TaskType::AddPiece, task_selector(), noop_action(), record(&log, 2))
        .await
        .unwrap();
    assert_eq!(*log.lock().unwrap(), vec![2]);

    // started work on the disabled worker still completes
    gate.add_permits(1);
    blocked.await.unwrap().unwrap();

    sched.close().await;
}

#[tokio::test]
async fn test_heartbeat_disables_and_reenables_worker() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    let worker = Arc::new(LocalWorker::new("w1", resources(1)));
    sched.register_worker(worker.clone()).await.unwrap();

    worker.set_healthy(false);
    assert_eventually(
        || async { !sched.info(&SchedContext::new()).await.unwrap().workers[0].enabled },
        Duration::from_secs(2),
        "unhealthy worker should be disabled",
    )
    .await;

    worker.set_healthy(true);
    assert_eventually(
        || async { sched.info(&SchedContext::new()).await.unwrap().workers[0].enabled },
        Duration::from_secs(2),
        "healthy worker should be enabled again",
    )
    .await;

    sched
        .schedule(&SchedContext::new(), sector(1), TaskType::AddPiece, task_selector(), noop_action(), noop_action())
        .await
        .unwrap();

    sched.close().await;
}

#[tokio::test]
async fn test_manual_disable_survives_heartbeat() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    let id = sched
        .register_worker(Arc::new(LocalWorker::new("w1", resources(1))))
        .await
        .unwrap();
    sched.disable_worker(id).await.unwrap();

    // several heartbeat intervals
    tokio::time::sleep(Duration::from_millis(250)).await;
    let info = sched.info(&SchedContext::new()).await.unwrap();
    assert!(!info.workers[0].enabled);

    sched.close().await;
}

#[tokio::test]
async fn test_restarted_worker_is_dropped_and_can_register_again() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    let worker = Arc::new(LocalWorker::new("w1", resources(1)));
    sched.register_worker(worker.clone()).await.unwrap();

    for _ in 0..2 {
        worker.restart();
        assert_eventually(
            || async { sched.worker_ids().await.is_empty() },
            Duration::from_secs(2),
            "restarted worker should be dropped",
        )
        .await;

        let id = sched.register_worker(worker.clone()).await.unwrap();
        assert_eq!(sched.worker_ids().await, vec![id]);
    }

    sched
        .schedule(&SchedContext::new(), sector(1), TaskType::AddPiece, task_selector(), noop_action(), noop_action())
        .await
        .unwrap();
    let info = sched.info(&SchedContext::new()).await.unwrap();
    assert_eq!(info.workers.len(), 1);

    let id = sched.worker_ids().await[0];
    sched.unregister_worker(id).await.unwrap();
    assert!(sched.worker_ids().await.is_empty());

    sched.close().await;
}

#[tokio::test]
async fn test_panicking_work_releases_the_slot() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    sched
        .register_worker(Arc::new(LocalWorker::new("w1", resources(1))))
        .await
        .unwrap();

    let work = action(|_| async {
        if true {
            panic!("sealing crashed");
        }
        Ok(())
    });
    let res = sched
        .schedule(&SchedContext::new(), sector(1), TaskType::AddPiece, task_selector(), noop_action(), work)
        .await;
    assert!(matches!(res, Err(SchedError::Worker(ref m)) if m.contains("sealing crashed")));

    tokio::time::timeout(
        Duration::from_secs(2),
        sched.schedule(&SchedContext::new(), sector(2), TaskType::AddPiece, task_selector(), noop_action(), noop_action()),
    )
    .await
    .expect("single slot should be free again")
    .unwrap();

    let info = sched.info(&SchedContext::new()).await.unwrap();
    assert!(info.workers[0].active.is_empty());
    assert!(info.workers[0].preparing.is_empty());
    assert!(info.running.is_empty());

    sched.close().await;
}

/// Worker whose session check hangs while `stalled` is set, which keeps its
/// session from picking up filled windows.
struct StallingWorker {
    inner: LocalWorker,
    stalled: AtomicBool,
}

#[async_trait]
impl Worker for StallingWorker {
    async fn info(&self) -> Result<WorkerInfo> {
        self.inner.info().await
    }

    async fn task_types(&self) -> Result<HashSet<TaskType>> {
        self.inner.task_types().await
    }

    async fn paths(&self) -> Result<Vec<StoragePath>> {
        self.inner.paths().await
    }

    async fn session(&self) -> Result<Uuid> {
        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.session().await
    }
}

#[tokio::test]
async fn test_unstarted_window_work_moves_to_another_worker() {
    let config = SchedulerConfig {
        heartbeat_timeout_ms: 400,
        ..test_config(10)
    }
    .with_sched_windows(3);
    let (sched, _loop) = Scheduler::start(config);

    let stalling = Arc::new(StallingWorker {
        inner: LocalWorker::new("w1", resources(3)),
        stalled: AtomicBool::new(false),
    });
    let w1 = sched.register_worker(stalling.clone()).await.unwrap();
    stalling.stalled.store(true, Ordering::SeqCst);
    // first heartbeat hangs from here on
    tokio::time::sleep(Duration::from_millis(100)).await;

    let hosts = Arc::new(Mutex::new(Vec::new()));
    let mut calls = Vec::new();
    for n in 0..3 {
        let sched_c = sched.clone();
        let hosts = Arc::clone(&hosts);
        let work = action(move |worker| async move {
            let host = worker.info().await?.hostname;
            hosts.lock().unwrap().push(host);
            Ok(())
        });
        calls.push(tokio::spawn(async move {
            sched_c
                .schedule(&SchedContext::new(), sector(n), TaskType::AddPiece, task_selector(), noop_action(), work)
                .await
        }));
    }

    assert_eventually(
        || async {
            let info = sched.info(&SchedContext::new()).await.unwrap();
            info.requests.is_empty() && info.running.is_empty()
        },
        Duration::from_secs(1),
        "requests should sit in w1's windows",
    )
    .await;

    sched.disable_worker(w1).await.unwrap();
    sched
        .register_worker(Arc::new(LocalWorker::new("w2", resources(3))))
        .await
        .unwrap();

    for call in calls {
        tokio::time::timeout(Duration::from_secs(3), call)
            .await
            .expect("requeued work should finish")
            .unwrap()
            .unwrap();
    }
    assert_eq!(*hosts.lock().unwrap(), vec!["w2"; 3]);

    sched.close().await;
}

#[tokio::test]
async fn test_register_same_session_twice() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    let worker = Arc::new(LocalWorker::new("w1", resources(1)));
    sched.register_worker(worker.clone()).await.unwrap();
    assert!(matches!(
        sched.register_worker(worker).await,
        Err(SchedError::WorkerAlreadyRegistered(_))
    ));
    sched.close().await;
}

/// Fails for one host, accepts every other one.
struct FailsOn(&'static str);

#[async_trait]
impl WorkerSelector for FailsOn {
    async fn ok(&self, _task: TaskType, _proof: RegisteredSealProof, worker: &WorkerHandle) -> Result<Eligibility> {
        if worker.info().hostname == self.0 {
            Err(SchedError::Selector("index unavailable".to_string()))
        } else {
            Ok(Eligibility::eligible())
        }
    }

    async fn cmp(&self, _task: TaskType, _a: &WorkerHandle, _b: &WorkerHandle) -> Result<bool> {
        Ok(false)
    }
}

#[tokio::test]
async fn test_selector_error_skips_only_that_worker() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    for host in ["bad", "good"] {
        sched
            .register_worker(Arc::new(LocalWorker::new(host, resources(1))))
            .await
            .unwrap();
    }

    let hosts = Arc::new(Mutex::new(Vec::new()));
    for n in 0..3 {
        let hosts = Arc::clone(&hosts);
        let work = action(move |worker| async move {
            let host = worker.info().await?.hostname;
            hosts.lock().unwrap().push(host);
            Ok(())
        });
        sched
            .schedule(&SchedContext::new(), sector(n), TaskType::AddPiece, Arc::new(FailsOn("bad")), noop_action(), work)
            .await
            .unwrap();
    }

    assert_eq!(*hosts.lock().unwrap(), vec!["good"; 3]);
    sched.close().await;
}

#[tokio::test]
async fn test_close_answers_queued_requests() {
    let (sched, sched_task) = Scheduler::start(test_config(10));

    let sched_c = sched.clone();
    let call = tokio::spawn(async move {
        sched_c
            .schedule(
                &SchedContext::new(),
                sector(1),
                TaskType::AddPiece,
                task_selector(),
                noop_action(),
                noop_action(),
            )
            .await
    });
    assert_eventually(
        || async { queued(&sched).await == 1 },
        Duration::from_secs(1),
        "request should be queued",
    )
    .await;

    tokio::time::timeout(Duration::from_secs(2), sched.close())
        .await
        .expect("close should finish");
    sched_task.await.unwrap();

    let res = call.await.unwrap();
    assert!(matches!(res, Err(SchedError::Closing)));
    assert!(sched.is_closing());
}

#[tokio::test]
async fn test_calls_after_close_fail_with_closing() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    sched.close().await;

    let res = sched
        .schedule(&SchedContext::new(), sector(1), TaskType::AddPiece, task_selector(), noop_action(), noop_action())
        .await;
    assert!(matches!(res, Err(SchedError::Closing)));

    let res = sched
        .register_worker(Arc::new(LocalWorker::new("late", resources(1))))
        .await;
    assert!(matches!(res, Err(SchedError::Closing)));

    assert!(matches!(
        sched.info(&SchedContext::new()).await,
        Err(SchedError::Closing)
    ));

    // closing twice is fine
    sched.close().await;
}

#[tokio::test]
async fn test_close_waits_for_worker_sessions() {
    let (sched, _loop) = Scheduler::start(test_config(10));
    for host in ["w1", "w2"] {
        sched
            .register_worker(Arc::new(LocalWorker::new(host, resources(1))))
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(2), sched.close())
        .await
        .expect("close should finish");
}

#[tokio::test]
async fn test_spread_assigner_uses_every_worker() {
    use sealing_scheduler::config::AssignerKind;

    let config = test_config(100).with_assigner(AssignerKind::Spread);
    let (sched, _loop) = Scheduler::start(config);
    for host in ["w1", "w2", "w3"] {
        sched
            .register_worker(Arc::new(LocalWorker::new(host, resources(4))))
            .await
            .unwrap();
    }

    let concurrency = Concurrency::default();
    let mut calls = Vec::new();
    for n in 0..6 {
        let sched_c = sched.clone();
        let work = concurrency.work(Duration::from_millis(50));
        calls.push(tokio::spawn(async move {
            sched_c
                .schedule(&SchedContext::new(), sector(n), TaskType::AddPiece, task_selector(), noop_action(), work)
                .await
        }));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert_eq!(concurrency.peaks().len(), 3);
    sched.close().await;
}
