//! Scheduling policy and cycle tests.


use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use drover::scheduler::{
    AllocationAction, AllocationPlan, FifoPolicy, SchedulerError, SchedulerPolicy, Task,
    TaskQueue, TaskState,
};
use drover::worker::{Worker, WorkerPool, WorkerState};
use test_harness::*;

fn queue_of(tasks: &[Arc<Task>]) -> TaskQueue {
    let mut queue = TaskQueue::new("default", "Default Queue");
    for t in tasks {
        queue.add_task(t.clone());
    }
    queue
}

#[test]
fn test_fifo_plan_follows_arrival_order() {
    let dir = TempDir::new().unwrap();
    let pool = WorkerPool::new(1, local_workers(2, &dir));
    let tasks = vec![task(&["true"]), task(&["true"]), task(&["true"])];
    let queue = queue_of(&tasks);

    let plan = FifoPolicy.schedule(&queue.snapshot(), &pool);

    assert_eq!(plan.len(), 2);
    assert_eq!(plan[0].task.id(), tasks[0].id());
    assert_eq!(plan[1].task.id(), tasks[1].id());
    assert!(plan.iter().all(|p| p.action == AllocationAction::Run));
}

#[test]
fn test_fifo_plan_uses_each_worker_once() {
    let dir = TempDir::new().unwrap();
    let pool = WorkerPool::new(1, local_workers(3, &dir));
    let tasks: Vec<_> = (0..5).map(|_| task(&["true"])).collect();
    let queue = queue_of(&tasks);

    let plan = FifoPolicy.schedule(&queue.snapshot(), &pool);

    let mut worker_ids: Vec<&str> = plan.iter().map(|p| p.worker.id()).collect();
    worker_ids.sort();
    worker_ids.dedup();
    assert_eq!(plan.len(), 3);
    assert_eq!(worker_ids.len(), 3);
}

#[test]
fn test_blocked_task_is_skipped_and_later_task_goes_ahead() {
    let dir = TempDir::new().unwrap();
    let pool = WorkerPool::new(
        1,
        vec![
            capability_worker("w-0", &[("cpu", "2")], &dir),
            capability_worker("w-1", &[("cpu", "2")], &dir),
        ],
    );
    let blocked = task_with_requirements(&["true"], &[("host", "cpu==4")]);
    let open = task(&["true"]);
    let queue = queue_of(&[blocked.clone(), open.clone()]);

    let plan = FifoPolicy.schedule(&queue.snapshot(), &pool);

    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].task.id(), open.id());
}

#[test]
fn test_capability_match_selects_matching_worker() {
    let dir = TempDir::new().unwrap();
    let pool = WorkerPool::new(
        1,
        vec![
            capability_worker("small", &[("cpu", "2")], &dir),
            capability_worker("big", &[("cpu", "4")], &dir),
        ],
    );
    let t = task_with_requirements(&["true"], &[("host", "cpu==4")]);
    let queue = queue_of(&[t]);

    let plan = FifoPolicy.schedule(&queue.snapshot(), &pool);

    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].worker.id(), "big");
}

#[test]
fn test_allocated_worker_is_not_planned() {
    let dir = TempDir::new().unwrap();
    let workers = local_workers(2, &dir);
    assert!(workers[0].try_allocate());
    let pool = WorkerPool::new(1, workers);
    let queue = queue_of(&[task(&["true"]), task(&["true"])]);

    let plan = FifoPolicy.schedule(&queue.snapshot(), &pool);

    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].worker.id(), "local-1");
}

#[test]
fn test_empty_pool_plans_nothing() {
    let pool = WorkerPool::new(1, Vec::new());
    let queue = queue_of(&[task(&["true"])]);
    assert!(FifoPolicy.schedule(&queue.snapshot(), &pool).is_empty());
}

#[tokio::test]
async fn test_cycle_dispatches_and_removes_allocated_tasks() {
    let dir = TempDir::new().unwrap();
    let engine = local_engine(2, &dir);
    let tasks = vec![
        task(&["sleep 0.2"]),
        task(&["sleep 0.2"]),
        task(&["sleep 0.2"]),
    ];
    engine
        .add_job("default", job("three", tasks.clone()))
        .await
        .unwrap();

    let report = engine.scheduler().run_cycle().await.unwrap();

    assert_eq!(report.dispatched, 2);
    assert_eq!(report.pending, 1);
    let queue = engine.queue();
    let queue = queue.read().await;
    assert!(!queue.contains(&tasks[0].id()));
    assert!(!queue.contains(&tasks[1].id()));
    assert!(queue.contains(&tasks[2].id()));
    drop(queue);

    assert_ne!(tasks[0].state().await, TaskState::Pending);
    assert_eq!(tasks[2].state().await, TaskState::Pending);
    engine.broker().wait_idle().await;
}

#[tokio::test]
async fn test_worker_returns_to_idle_after_task() {
    let dir = TempDir::new().unwrap();
    let engine = local_engine(1, &dir);
    let t = task(&["true"]);
    engine
        .add_job("default", job("one", vec![t.clone()]))
        .await
        .unwrap();

    engine.scheduler().run_cycle().await.unwrap();
    engine.broker().wait_idle().await;

    assert_eq!(t.state().await, TaskState::Finished);
    let pool = engine.pool();
    let pool = pool.read().await;
    assert_eq!(pool.workers()[0].state(), WorkerState::Idle);
}

#[tokio::test]
async fn test_empty_queue_cycle_is_idle() {
    let dir = TempDir::new().unwrap();
    let engine = local_engine(2, &dir);
    let report = engine.scheduler().run_cycle().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.pending, 0);
}

/// Plans a task that was never queued.
#[derive(Debug)]
struct StalePolicy;

impl SchedulerPolicy for StalePolicy {
    fn schedule(&self, _queue: &[Arc<Task>], pool: &WorkerPool) -> Vec<AllocationPlan> {
        vec![AllocationPlan::run(task(&["true"]), pool.workers()[0].clone())]
    }
}

/// Plans every queued task onto the first worker.
#[derive(Debug)]
struct DoubleBookingPolicy;

impl SchedulerPolicy for DoubleBookingPolicy {
    fn schedule(&self, queue: &[Arc<Task>], pool: &WorkerPool) -> Vec<AllocationPlan> {
        queue
            .iter()
            .map(|t| AllocationPlan::run(t.clone(), pool.workers()[0].clone()))
            .collect()
    }
}

/// Emits only STOP entries.
#[derive(Debug)]
struct StopPolicy;

impl SchedulerPolicy for StopPolicy {
    fn schedule(&self, queue: &[Arc<Task>], pool: &WorkerPool) -> Vec<AllocationPlan> {
        queue
            .iter()
            .map(|t| AllocationPlan {
                action: AllocationAction::Stop,
                task: t.clone(),
                worker: pool.workers()[0].clone(),
            })
            .collect()
    }
}

#[tokio::test]
async fn test_plan_for_unqueued_task_is_fatal() {
    let dir = TempDir::new().unwrap();
    let engine = local_engine(1, &dir);
    let scheduler = engine.scheduler_with_policy(Box::new(StalePolicy));

    let err = scheduler.run_cycle().await.unwrap_err();
    assert!(matches!(err, SchedulerError::TaskNotQueued(_)));
}

#[tokio::test]
async fn test_plan_for_busy_worker_is_fatal() {
    let dir = TempDir::new().unwrap();
    let engine = local_engine(1, &dir);
    engine
        .add_job(
            "default",
            job("two", vec![task(&["sleep 0.2"]), task(&["sleep 0.2"])]),
        )
        .await
        .unwrap();
    let scheduler = engine.scheduler_with_policy(Box::new(DoubleBookingPolicy));

    let err = scheduler.run_cycle().await.unwrap_err();
    assert!(matches!(err, SchedulerError::WorkerNotIdle(ref id) if id == "local-0"));

    // The first entry was applied before the failure
    assert_eq!(engine.queue().read().await.len(), 1);
    engine.broker().wait_idle().await;
}

#[tokio::test]
async fn test_stop_entries_change_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = local_engine(1, &dir);
    let t = task(&["true"]);
    engine
        .add_job("default", job("one", vec![t.clone()]))
        .await
        .unwrap();
    let scheduler = engine.scheduler_with_policy(Box::new(StopPolicy));

    let report = scheduler.run_cycle().await.unwrap();

    assert_eq!(report.dispatched, 0);
    assert_eq!(report.pending, 1);
    assert_eq!(t.state().await, TaskState::Pending);
    let pool = engine.pool();
    assert_eq!(pool.read().await.idle_count(), 1);
}

#[tokio::test]
async fn test_scheduler_stops_on_cancellation() {
    let dir = TempDir::new().unwrap();
    let engine = local_engine(1, &dir);
    let shutdown = CancellationToken::new();

    let handle = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_blocked_task_waits_until_capable_worker_added() {
    let dir = TempDir::new().unwrap();
    let pool = WorkerPool::new(1, vec![capability_worker("w-0", &[("cpu", "2")], &dir)]);
    let engine = Arc::new(drover::engine::Engine::new(test_engine_config(&dir), pool));
    let blocked = task_with_requirements(&["true"], &[("host", "cpu==4")]);
    engine
        .add_job("default", job("blocked", vec![blocked.clone()]))
        .await
        .unwrap();

    let scheduler = engine.scheduler();
    assert_eq!(scheduler.run_cycle().await.unwrap().dispatched, 0);
    assert_eq!(blocked.state().await, TaskState::Pending);

    engine
        .add_workers(vec![capability_worker("w-1", &[("cpu", "4")], &dir)])
        .await;
    assert_eq!(scheduler.run_cycle().await.unwrap().dispatched, 1);
    engine.broker().wait_idle().await;
    assert_eq!(blocked.state().await, TaskState::Finished);
}
