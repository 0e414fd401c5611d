use std::sync::Arc;

use tokio_util::task::TaskTracker;

use crate::scheduler::job::Task;
use crate::worker::Worker;

/// Runs allocated tasks off the scheduling loop and reconciles their final state.
///
/// Concurrency is bounded by allocation: a worker carries at most one task.
#[derive(Debug, Clone, Default)]
pub struct ExecutionBroker {
    tracker: TaskTracker,
}

impl ExecutionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start executing `task` on an already allocated `worker` and return immediately.
    pub fn execute(&self, task: Arc<Task>, worker: Arc<dyn Worker>) {
        tracing::info!(task_id = %task.id(), worker = %worker, "Dispatching task");
        self.tracker.spawn(async move {
            let result = worker.execute(&task).await;
            // Terminal task state first: the worker must not look idle while
            // its task is still running.
            task.set_state(result.task_state()).await;
            worker.release();
            tracing::info!(
                task_id = %task.id(),
                worker_id = worker.id(),
                state = %result.task_state(),
                "Task finished, worker released"
            );
        });
    }

    /// Number of executions still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every dispatched execution has completed.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
