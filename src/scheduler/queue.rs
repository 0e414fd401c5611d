use std::collections::VecDeque;
use std::sync::Arc;

use uuid::Uuid;

use crate::scheduler::job::Task;

/// Pending tasks in arrival order.
///
/// Shared as `Arc<RwLock<TaskQueue>>`: producers append under the write lock and
/// the scheduler holds the write lock while it plans and dequeues.
#[derive(Debug)]
pub struct TaskQueue {
    id: String,
    name: String,
    tasks: VecDeque<Arc<Task>>,
}

impl TaskQueue {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a task at the tail. Returns false if the task is already queued.
    pub fn add_task(&mut self, task: Arc<Task>) -> bool {
        if self.contains(&task.id()) {
            return false;
        }
        self.tasks.push_back(task);
        true
    }

    /// Remove a task by identity, returning it if it was queued.
    pub fn remove_task(&mut self, task_id: &Uuid) -> Option<Arc<Task>> {
        let position = self.tasks.iter().position(|t| t.id() == *task_id)?;
        self.tasks.remove(position)
    }

    /// Current contents in arrival order.
    pub fn snapshot(&self) -> Vec<Arc<Task>> {
        self.tasks.iter().cloned().collect()
    }

    pub fn contains(&self, task_id: &Uuid) -> bool {
        self.tasks.iter().any(|t| t.id() == *task_id)
    }

    pub fn task_ids(&self) -> Vec<Uuid> {
        self.tasks.iter().map(|t| t.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Display for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "id={{{}}} name={{{}}} pending={{{}}}", self.id, self.name, self.len())
    }
}
