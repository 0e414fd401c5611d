use std::sync::Arc;

use crate::scheduler::job::Task;
use crate::worker::{Worker, WorkerState};

/// The workers available to one queue, in provisioning order.
#[derive(Debug)]
pub struct WorkerPool {
    id: u32,
    workers: Vec<Arc<dyn Worker>>,
}

impl WorkerPool {
    pub fn new(id: u32, workers: Vec<Arc<dyn Worker>>) -> Self {
        Self { id, workers }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Scale out at runtime.
    pub fn add_worker(&mut self, worker: Arc<dyn Worker>) {
        tracing::info!(pool_id = self.id, worker = %worker, "Worker added to pool");
        self.workers.push(worker);
    }

    pub fn workers(&self) -> &[Arc<dyn Worker>] {
        &self.workers
    }

    /// Idle workers able to run `task`, in pool order.
    pub fn match_task(&self, task: &Task) -> Vec<Arc<dyn Worker>> {
        self.workers
            .iter()
            .filter(|w| w.state() == WorkerState::Idle && w.matches(task.requirements()))
            .cloned()
            .collect()
    }

    pub fn idle_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state() == WorkerState::Idle)
            .count()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl std::fmt::Display for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id={{{}}} workers={{{}}} idle={{{}}}",
            self.id,
            self.len(),
            self.idle_count()
        )
    }
}
