use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::scheduler::job::Task;
use crate::scheduler::requirements::{Capabilities, Requirements};
use crate::worker::executor::{TaskExecutionResult, TaskExecutor};
use crate::worker::{Allocation, Worker, WorkerState};

/// Accepts every requirement set. Used for best-effort raw pools.
#[derive(Debug)]
pub struct MatchAnyWorker {
    id: String,
    pool_id: u32,
    allocation: Allocation,
    executor: Arc<dyn TaskExecutor>,
}

impl MatchAnyWorker {
    pub fn new(id: impl Into<String>, pool_id: u32, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            id: id.into(),
            pool_id,
            allocation: Allocation::default(),
            executor,
        }
    }
}

#[async_trait]
impl Worker for MatchAnyWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn pool_id(&self) -> u32 {
        self.pool_id
    }

    fn state(&self) -> WorkerState {
        self.allocation.state()
    }

    fn try_allocate(&self) -> bool {
        self.allocation.try_allocate()
    }

    fn release(&self) {
        self.allocation.release()
    }

    fn matches(&self, _requirements: &Requirements) -> bool {
        true
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        self.executor.metadata()
    }

    async fn execute(&self, task: &Task) -> TaskExecutionResult {
        self.executor.execute(task).await
    }
}

impl std::fmt::Display for MatchAnyWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id={{{}}} pool={{{}}} executor={{{}}}",
            self.id, self.pool_id, self.executor
        )
    }
}

/// Matches the clauses it recognizes against its declared capabilities.
#[derive(Debug)]
pub struct CapabilityWorker {
    id: String,
    pool_id: u32,
    capabilities: Capabilities,
    allocation: Allocation,
    executor: Arc<dyn TaskExecutor>,
}

impl CapabilityWorker {
    pub fn new(
        id: impl Into<String>,
        pool_id: u32,
        capabilities: Capabilities,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            pool_id,
            capabilities,
            allocation: Allocation::default(),
            executor,
        }
    }
}

#[async_trait]
impl Worker for CapabilityWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn pool_id(&self) -> u32 {
        self.pool_id
    }

    fn state(&self) -> WorkerState {
        self.allocation.state()
    }

    fn try_allocate(&self) -> bool {
        self.allocation.try_allocate()
    }

    fn release(&self) {
        self.allocation.release()
    }

    fn matches(&self, requirements: &Requirements) -> bool {
        self.capabilities.satisfies(requirements)
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = self.executor.metadata();
        metadata.extend(
            self.capabilities
                .values()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        metadata
    }

    async fn execute(&self, task: &Task) -> TaskExecutionResult {
        self.executor.execute(task).await
    }
}

impl std::fmt::Display for CapabilityWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id={{{}}} pool={{{}}} executor={{{}}}",
            self.id, self.pool_id, self.executor
        )
    }
}
