use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use edge_scheduler_core::{
    models::{SchedulerSpec, TaskPhase, TaskSpec, TaskStatusUpdate, WorkerPoolSpec},
    SchedulerError,
};
use edge_scheduler_dispatcher::{ExecutorFactory, Scheduler, TaskContext};
use edge_scheduler_infrastructure::DatabaseManager;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

const POOL: &str = "testPool";

async fn setup_with(spec: SchedulerSpec, pool: WorkerPoolSpec) -> Scheduler {
    let db = DatabaseManager::in_memory().await.unwrap();
    let scheduler = Scheduler::new(db.task_repository(), spec);
    scheduler.start().await.unwrap();
    assert!(scheduler.register_worker_pool(pool).await.unwrap());

    scheduler
        .register_executor_factory(ExecutorFactory::from_fn("block", |ctx: Arc<TaskContext>| async move {
            ctx.graceful_shutdown().cancelled().await;
            Ok(())
        }))
        .await;
    scheduler
        .register_executor_factory(ExecutorFactory::from_fn("ignore", |_ctx: Arc<TaskContext>| async move {
            sleep(Duration::from_secs(30)).await;
            Ok(())
        }))
        .await;
    scheduler
        .register_executor_factory(ExecutorFactory::from_fn("quick", |_ctx: Arc<TaskContext>| async move {
            Ok(())
        }))
        .await;
    scheduler
}

async fn setup(concurrency: usize, capacity: usize) -> Scheduler {
    setup_with(
        SchedulerSpec::default(),
        WorkerPoolSpec::new(POOL, concurrency, capacity),
    )
    .await
}

async fn wait_for_phase(ctx: &TaskContext, phase: TaskPhase, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if ctx.get_status().await.unwrap().phase == phase {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_wait_timeout() {
    let scheduler = setup(1, 10).await;
    let occupier = scheduler
        .submit_task(TaskSpec::new("ignore", POOL))
        .await
        .unwrap();
    assert!(wait_for_phase(&occupier, TaskPhase::Processing, Duration::from_millis(200)).await);

    let waiting = scheduler
        .submit_task(TaskSpec::new("quick", POOL).with_wait_timeout(Duration::from_millis(100)))
        .await
        .unwrap();
    assert!(wait_for_phase(&waiting, TaskPhase::Failed, Duration::from_millis(300)).await);

    let status = waiting.get_status().await.unwrap();
    assert_eq!(status.message, "task wait timeout");
    assert!(status.finished_at.is_some());
    assert!(status.started_at.is_none());
}

#[tokio::test]
async fn test_execute_timeout() {
    let scheduler = setup(1, 0).await;
    let ctx = scheduler
        .submit_task(TaskSpec::new("ignore", POOL).with_execute_timeout(Duration::from_millis(200)))
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.get_status().await.unwrap().phase, TaskPhase::Processing);

    sleep(Duration::from_millis(300)).await;
    let status = ctx.get_status().await.unwrap();
    assert_eq!(status.phase, TaskPhase::Failed);
    assert!(status.started_at.is_some());
}

#[tokio::test]
async fn test_graceful_shutdown_timeout() {
    let scheduler = setup(1, 0).await;
    let ctx = scheduler
        .submit_task(
            TaskSpec::new("ignore", POOL).with_graceful_shutdown_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    assert!(wait_for_phase(&ctx, TaskPhase::Processing, Duration::from_millis(200)).await);

    ctx.cancel();
    assert!(wait_for_phase(&ctx, TaskPhase::Aborting, Duration::from_millis(50)).await);
    assert!(ctx.graceful_shutdown().is_cancelled());
    assert!(wait_for_phase(&ctx, TaskPhase::Failed, Duration::from_millis(300)).await);
    assert_eq!(ctx.get_status().await.unwrap().message, "graceful shutdown timeout");
}

#[tokio::test]
async fn test_user_updates() {
    let scheduler = setup(1, 0).await;
    let ctx = scheduler
        .submit_task(TaskSpec::new("block", POOL))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let status = ctx
        .update_status(TaskStatusUpdate::phase(TaskPhase::Processing).with_progress(10))
        .await
        .unwrap();
    assert_eq!(status.progress, 10);

    let status = ctx
        .update_status(TaskStatusUpdate::phase(TaskPhase::Failed).with_message("user abort"))
        .await
        .unwrap();
    assert_eq!(status.phase, TaskPhase::Failed);
    assert!(status.finished_at.is_some());

    for phase in [TaskPhase::Waiting, TaskPhase::Succeed] {
        let err = ctx
            .update_status(TaskStatusUpdate::phase(phase))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                SchedulerError::AlreadyFinished | SchedulerError::NoRowsAffected
            ),
            "unexpected error {err:?}"
        );
    }
    assert_eq!(ctx.get_status().await.unwrap().phase, TaskPhase::Failed);
}

#[tokio::test]
async fn test_user_cannot_advance_phase() {
    let scheduler = setup(1, 1).await;
    let _occupier = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    let queued = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let err = queued
        .update_status(TaskStatusUpdate::phase(TaskPhase::Processing))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::AlreadyFinished));

    let status = queued
        .update_status(TaskStatusUpdate::progress(5, "still waiting"))
        .await
        .unwrap();
    assert_eq!(status.phase, TaskPhase::Waiting);
    assert_eq!(status.message, "still waiting");
}

#[tokio::test]
async fn test_user_cannot_set_timestamps() {
    let scheduler = setup(1, 0).await;
    let ctx = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    assert!(wait_for_phase(&ctx, TaskPhase::Processing, Duration::from_millis(200)).await);
    let started_at = ctx.get_status().await.unwrap().started_at;
    assert!(started_at.is_some());

    let forged = Utc::now() - chrono::Duration::hours(1);
    let status = ctx
        .update_status(
            TaskStatusUpdate::progress(20, "half way")
                .with_started_at(forged)
                .with_finished_at(forged),
        )
        .await
        .unwrap();
    assert_eq!(status.phase, TaskPhase::Processing);
    assert_eq!(status.progress, 20);
    assert_eq!(status.started_at, started_at);
    assert!(status.finished_at.is_none());

    let status = ctx
        .update_status(TaskStatusUpdate::phase(TaskPhase::Succeed).with_finished_at(forged))
        .await
        .unwrap();
    assert!(status.finished_at.unwrap() > forged);
}

#[tokio::test]
async fn test_concurrency_control() {
    let scheduler = setup(1, 1).await;
    let first = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    let second = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    let third = scheduler.submit_task(TaskSpec::new("block", POOL)).await;
    assert!(matches!(third, Err(SchedulerError::FullQueue { .. })));

    assert!(wait_for_phase(&first, TaskPhase::Processing, Duration::from_millis(200)).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(second.get_status().await.unwrap().phase, TaskPhase::Waiting);

    let stats = scheduler.pool_stats(POOL).await.unwrap();
    assert_eq!(stats.running, 1);
    assert_eq!(stats.queued, 1);

    // 被拒绝的任务不留存记录
    assert_eq!(scheduler.repository().count_tasks().await.unwrap(), 2);

    first.cancel();
    assert!(wait_for_phase(&second, TaskPhase::Processing, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_iterate_sub_tasks() {
    let scheduler = setup(4, 10).await;
    let master = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    let mut child_ids = Vec::new();
    for _ in 0..2 {
        let child = scheduler
            .submit_task(TaskSpec::new("quick", POOL).with_parent(master.id()))
            .await
            .unwrap();
        child_ids.push(child.id().to_string());
    }
    for id in &child_ids {
        let ctx = scheduler.get_task_context(id).await.unwrap();
        assert!(wait_for_phase(&ctx, TaskPhase::Succeed, Duration::from_millis(300)).await);
    }

    let mut selector = scheduler.new_sub_task_selector(master.id()).await.unwrap();
    let cancel = master.graceful_shutdown().clone();
    let mut seen = Vec::new();
    for _ in 0..2 {
        let child = selector.select(&cancel).await.unwrap();
        assert_eq!(child.get_status().await.unwrap().phase, TaskPhase::Succeed);
        seen.push(child.id().to_string());
    }
    seen.sort();
    child_ids.sort();
    assert_eq!(seen, child_ids);
    assert!(matches!(
        selector.select(&cancel).await,
        Err(SchedulerError::NoRunningSubTask)
    ));
}

#[tokio::test]
async fn test_selector_waits_for_running_children() {
    let scheduler = setup(4, 10).await;
    let master = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    let child = scheduler
        .submit_task(TaskSpec::new("block", POOL).with_parent(master.id()))
        .await
        .unwrap();
    let mut selector = scheduler.new_sub_task_selector(master.id()).await.unwrap();

    let finisher = child.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        finisher
            .update_status(TaskStatusUpdate::phase(TaskPhase::Succeed))
            .await
            .unwrap();
    });

    let started = Instant::now();
    let selected = selector.select(master.graceful_shutdown()).await.unwrap();
    assert_eq!(selected.id(), child.id());
    assert!(started.elapsed() >= Duration::from_millis(80));

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        selector.select(&cancel).await,
        Err(SchedulerError::NoRunningSubTask)
    ));
}

#[tokio::test]
async fn test_selector_cancelled() {
    let scheduler = setup(4, 10).await;
    let master = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    scheduler
        .submit_task(TaskSpec::new("block", POOL).with_parent(master.id()))
        .await
        .unwrap();
    let mut selector = scheduler.new_sub_task_selector(master.id()).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    assert!(matches!(
        selector.select(&cancel).await,
        Err(SchedulerError::Cancelled)
    ));
}

#[tokio::test]
async fn test_heartbeat_timeout() {
    let scheduler = setup(1, 0).await;
    let ctx = scheduler
        .submit_task(
            TaskSpec::new("ignore", POOL)
                .with_heartbeat_timeout(Duration::from_millis(150))
                .with_graceful_shutdown_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    assert!(wait_for_phase(&ctx, TaskPhase::Processing, Duration::from_millis(100)).await);

    for _ in 0..4 {
        sleep(Duration::from_millis(60)).await;
        ctx.update_liveness();
    }
    assert_eq!(ctx.get_status().await.unwrap().phase, TaskPhase::Processing);

    assert!(wait_for_phase(&ctx, TaskPhase::Failed, Duration::from_millis(400)).await);
}

#[tokio::test]
async fn test_cancel_master_cascades_to_children() {
    let scheduler = setup(4, 10).await;
    let master = scheduler
        .submit_task(
            TaskSpec::new("block", POOL).with_graceful_shutdown_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    let child = scheduler
        .submit_task(TaskSpec::new("ignore", POOL).with_parent(master.id()))
        .await
        .unwrap();
    assert!(wait_for_phase(&child, TaskPhase::Processing, Duration::from_millis(200)).await);

    master.cancel();
    assert!(wait_for_phase(&child, TaskPhase::Failed, Duration::from_millis(300)).await);
    assert!(wait_for_phase(&master, TaskPhase::Failed, Duration::from_millis(300)).await);
    assert_eq!(
        master.get_status().await.unwrap().message,
        "executor exited during graceful shutdown"
    );

    let tree = master.get_sub_task_tree().await.unwrap();
    assert_eq!(tree.children.len(), 1);
}

fn explode() -> edge_scheduler_core::SchedulerResult<()> {
    panic!("boom")
}

#[tokio::test]
async fn test_executor_results() {
    let scheduler = setup(2, 4).await;
    scheduler
        .register_executor_factory(ExecutorFactory::from_fn("fail", |_ctx: Arc<TaskContext>| async move {
            Err(SchedulerError::invalid_params("missing nodeIDs"))
        }))
        .await;
    scheduler
        .register_executor_factory(ExecutorFactory::from_fn("panic", |_ctx: Arc<TaskContext>| async move {
            explode()
        }))
        .await;
    scheduler
        .register_executor_factory(ExecutorFactory::from_fn("partial", |ctx: Arc<TaskContext>| async move {
            ctx.update_status(TaskStatusUpdate::phase(TaskPhase::PartiallyFailed))
                .await
                .map(|_| ())
        }))
        .await;

    let quick = scheduler.submit_task(TaskSpec::new("quick", POOL)).await.unwrap();
    assert!(wait_for_phase(&quick, TaskPhase::Succeed, Duration::from_millis(300)).await);
    assert_eq!(quick.get_status().await.unwrap().progress, 100);

    let fail = scheduler.submit_task(TaskSpec::new("fail", POOL)).await.unwrap();
    assert!(wait_for_phase(&fail, TaskPhase::Failed, Duration::from_millis(300)).await);
    assert!(fail.get_status().await.unwrap().message.contains("missing nodeIDs"));

    let panicking = scheduler.submit_task(TaskSpec::new("panic", POOL)).await.unwrap();
    assert!(wait_for_phase(&panicking, TaskPhase::Failed, Duration::from_millis(300)).await);
    assert!(panicking.get_status().await.unwrap().message.contains("boom"));

    let partial = scheduler.submit_task(TaskSpec::new("partial", POOL)).await.unwrap();
    assert!(wait_for_phase(&partial, TaskPhase::PartiallyFailed, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_submit_rejections() {
    let spec = SchedulerSpec {
        max_active_tasks: 2,
        ..SchedulerSpec::default()
    };
    let scheduler = setup_with(spec, WorkerPoolSpec::new(POOL, 4, 4)).await;

    assert!(matches!(
        scheduler.submit_task(TaskSpec::new("unknown", POOL)).await,
        Err(SchedulerError::FactoryNotFound { .. })
    ));
    assert!(matches!(
        scheduler.submit_task(TaskSpec::new("quick", "nopool")).await,
        Err(SchedulerError::WorkerPoolNotFound { .. })
    ));
    assert!(matches!(
        scheduler
            .submit_task(TaskSpec::new("quick", POOL).with_parent("ghost"))
            .await,
        Err(SchedulerError::TaskNotFound { .. })
    ));

    let first = scheduler
        .submit_task(TaskSpec::new("block", POOL).with_id("fixed"))
        .await
        .unwrap();
    assert!(matches!(
        scheduler
            .submit_task(TaskSpec::new("block", POOL).with_id("fixed"))
            .await,
        Err(SchedulerError::Conflict { .. })
    ));
    let _second = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    assert!(matches!(
        scheduler.submit_task(TaskSpec::new("block", POOL)).await,
        Err(SchedulerError::TooManyTask)
    ));
    assert_eq!(scheduler.active_tasks(), 2);

    first.cancel();
    assert!(wait_for_phase(&first, TaskPhase::Failed, Duration::from_millis(300)).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.active_tasks(), 1);
    assert!(scheduler.submit_task(TaskSpec::new("block", POOL)).await.is_ok());
}

#[tokio::test]
async fn test_sub_task_cannot_be_parent() {
    let scheduler = setup(4, 4).await;
    let master = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    let child = scheduler
        .submit_task(TaskSpec::new("block", POOL).with_parent(master.id()))
        .await
        .unwrap();

    let result = scheduler
        .submit_task(TaskSpec::new("quick", POOL).with_parent(child.id()))
        .await;
    assert!(matches!(result, Err(SchedulerError::TaskNotFound { .. })));
    assert_eq!(scheduler.active_tasks(), 2);

    let tree = master.get_sub_task_tree().await.unwrap();
    assert_eq!(tree.children.len(), 1);
    assert!(tree.children[0].children.is_empty());
}

#[tokio::test]
async fn test_conflict_with_finished_task() {
    let scheduler = setup(2, 2).await;
    let done = scheduler
        .submit_task(TaskSpec::new("quick", POOL).with_id("once"))
        .await
        .unwrap();
    assert!(wait_for_phase(&done, TaskPhase::Succeed, Duration::from_millis(300)).await);
    sleep(Duration::from_millis(50)).await;
    assert!(!scheduler.get_task_context("once").await.unwrap().is_live());

    assert!(matches!(
        scheduler
            .submit_task(TaskSpec::new("quick", POOL).with_id("once"))
            .await,
        Err(SchedulerError::Conflict { .. })
    ));
    assert_eq!(scheduler.active_tasks(), 0);
}

#[tokio::test]
async fn test_database_ceiling() {
    let spec = SchedulerSpec {
        allowed_max_tasks_in_db: 1,
        ..SchedulerSpec::default()
    };
    let scheduler = setup_with(spec, WorkerPoolSpec::new(POOL, 1, 1)).await;
    scheduler.submit_task(TaskSpec::new("quick", POOL)).await.unwrap();
    assert!(matches!(
        scheduler.submit_task(TaskSpec::new("quick", POOL)).await,
        Err(SchedulerError::TooManyTask)
    ));
}

#[tokio::test]
async fn test_named_task_id_and_historical_context() {
    let scheduler = setup(1, 0).await;
    let ctx = scheduler
        .submit_task(TaskSpec::new("quick", POOL).with_name("dumpSingleNodeLog.sn-7"))
        .await
        .unwrap();
    assert!(ctx.id().starts_with("dumpSingleNodeLog.sn-7."));
    assert!(wait_for_phase(&ctx, TaskPhase::Succeed, Duration::from_millis(300)).await);
    sleep(Duration::from_millis(50)).await;

    let historical = scheduler.get_task_context(ctx.id()).await.unwrap();
    assert!(!historical.is_live());
    assert!(historical.done().is_cancelled());
    assert_eq!(historical.phase(), TaskPhase::Succeed);
    assert!(matches!(
        historical.update_status(TaskStatusUpdate::progress(1, "late")).await,
        Err(SchedulerError::AlreadyFinished)
    ));
    assert!(matches!(
        ctx.update_status(TaskStatusUpdate::progress(1, "late")).await,
        Err(SchedulerError::AlreadyFinished)
    ));

    assert!(matches!(
        scheduler.get_task_context("absent").await,
        Err(SchedulerError::TaskNotFound { .. })
    ));
}

#[tokio::test]
async fn test_history_pruned_beyond_limit() {
    let spec = SchedulerSpec {
        max_history_master_tasks: 2,
        ..SchedulerSpec::default()
    };
    let scheduler = setup_with(spec, WorkerPoolSpec::new(POOL, 1, 10)).await;

    let mut ids = Vec::new();
    for _ in 0..4 {
        let ctx = scheduler.submit_task(TaskSpec::new("quick", POOL)).await.unwrap();
        assert!(wait_for_phase(&ctx, TaskPhase::Succeed, Duration::from_millis(300)).await);
        ids.push(ctx.id().to_string());
        sleep(Duration::from_millis(20)).await;
    }
    sleep(Duration::from_millis(100)).await;

    let repo = scheduler.repository();
    assert_eq!(repo.count_tasks().await.unwrap(), 2);
    assert!(repo.get(&ids[0]).await.is_err());
    assert!(repo.get(&ids[3]).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_fails_live_tasks() {
    let scheduler = setup(1, 1).await;
    let running = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    let queued = scheduler.submit_task(TaskSpec::new("block", POOL)).await.unwrap();
    assert!(wait_for_phase(&running, TaskPhase::Processing, Duration::from_millis(200)).await);

    scheduler.shutdown(Duration::from_secs(1)).await;
    assert_eq!(running.get_status().await.unwrap().phase, TaskPhase::Failed);
    assert_eq!(queued.get_status().await.unwrap().phase, TaskPhase::Failed);
    assert_eq!(scheduler.active_tasks(), 0);
}
