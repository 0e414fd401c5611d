use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::job::TaskState;
use crate::scheduler::policy::{AllocationAction, AllocationPlan, SchedulerPolicy};
use crate::scheduler::queue::TaskQueue;
use crate::worker::{ExecutionBroker, WorkerPool};

/// A scheduling cycle left queue or pool in a state the plan did not expect.
///
/// Fatal: the loop stops and hands the error to its caller.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Planned task {0} is no longer queued")]
    TaskNotQueued(Uuid),

    #[error("Planned worker {0} is not idle")]
    WorkerNotIdle(String),
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub dispatched: usize,
    pub pending: usize,
}

/// Periodically turns the queue into allocations and hands them to the broker.
#[derive(Debug)]
pub struct Scheduler {
    queue: Arc<RwLock<TaskQueue>>,
    pool: Arc<RwLock<WorkerPool>>,
    policy: Box<dyn SchedulerPolicy>,
    broker: ExecutionBroker,
    period: Duration,
}

impl Scheduler {
    pub fn new(
        queue: Arc<RwLock<TaskQueue>>,
        pool: Arc<RwLock<WorkerPool>>,
        policy: Box<dyn SchedulerPolicy>,
        broker: ExecutionBroker,
        period: Duration,
    ) -> Self {
        Self {
            queue,
            pool,
            policy,
            broker,
            period,
        }
    }

    /// Run cycles every `period` until `shutdown` is cancelled or a cycle fails.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SchedulerError> {
        tracing::info!(period_ms = self.period.as_millis() as u64, "Scheduler started");
        loop {
            if let Err(e) = self.run_cycle().await {
                tracing::error!(error = %e, "Scheduler execution aborted");
                return Err(e);
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.period) => {}
            }
        }
    }

    /// Compute one plan and apply it.
    ///
    /// The queue write lock is held from snapshot to the last dispatch, so
    /// planning and allocation are a single step with respect to producers and
    /// other cycles. Lock order is queue, then pool.
    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        let mut queue = self.queue.write().await;
        let pool = self.pool.read().await;

        let snapshot = queue.snapshot();
        let plan = self.policy.schedule(&snapshot, &pool);

        let mut dispatched = 0;
        for entry in plan {
            match entry.action {
                AllocationAction::Run => {
                    self.apply_run(&mut queue, entry).await?;
                    dispatched += 1;
                }
                AllocationAction::Stop => {
                    tracing::debug!(task_id = %entry.task.id(), "Ignoring STOP allocation, preemption is not supported");
                }
            }
        }

        let report = CycleReport {
            dispatched,
            pending: queue.len(),
        };
        if dispatched > 0 {
            tracing::info!(dispatched, pending = report.pending, "Scheduling cycle applied");
        } else {
            tracing::trace!(pending = report.pending, "Scheduling cycle idle");
        }
        Ok(report)
    }

    async fn apply_run(
        &self,
        queue: &mut TaskQueue,
        entry: AllocationPlan,
    ) -> Result<(), SchedulerError> {
        let task_id = entry.task.id();
        if !queue.contains(&task_id) {
            return Err(SchedulerError::TaskNotQueued(task_id));
        }
        if !entry.worker.try_allocate() {
            return Err(SchedulerError::WorkerNotIdle(entry.worker.id().to_string()));
        }

        queue.remove_task(&task_id);
        entry.task.set_state(TaskState::Running).await;
        tracing::debug!(task_id = %task_id, worker_id = entry.worker.id(), "Task allocated");

        self.broker.execute(entry.task, entry.worker);
        Ok(())
    }
}
