use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::scheduler::job::Task;
use crate::worker::{Worker, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationAction {
    Run,
    /// Reserved for preemption; no policy produces it yet.
    Stop,
}

/// One decision of a scheduling cycle.
#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub action: AllocationAction,
    pub task: Arc<Task>,
    pub worker: Arc<dyn Worker>,
}

impl AllocationPlan {
    pub fn run(task: Arc<Task>, worker: Arc<dyn Worker>) -> Self {
        Self {
            action: AllocationAction::Run,
            task,
            worker,
        }
    }
}

/// Decides which queued tasks go to which workers. Must not mutate anything.
pub trait SchedulerPolicy: Send + Sync + std::fmt::Debug {
    fn schedule(&self, queue: &[Arc<Task>], pool: &WorkerPool) -> Vec<AllocationPlan>;
}

/// Arrival-order policy.
///
/// A task with no idle matching worker is skipped and later tasks may go
/// ahead of it. Nothing ages skipped tasks, so a task with rare requirements
/// can wait indefinitely under sustained load.
#[derive(Debug, Default, Clone, Copy)]
pub struct FifoPolicy;

impl SchedulerPolicy for FifoPolicy {
    fn schedule(&self, queue: &[Arc<Task>], pool: &WorkerPool) -> Vec<AllocationPlan> {
        let mut plan = Vec::new();
        let mut taken_workers: HashSet<String> = HashSet::new();
        let mut planned_tasks: HashSet<Uuid> = HashSet::new();

        for task in queue {
            if planned_tasks.contains(&task.id()) {
                continue;
            }
            let candidate = pool
                .match_task(task)
                .into_iter()
                .find(|w| !taken_workers.contains(w.id()));

            if let Some(worker) = candidate {
                taken_workers.insert(worker.id().to_string());
                planned_tasks.insert(task.id());
                plan.push(AllocationPlan::run(task.clone(), worker));
            }
        }
        plan
    }
}
