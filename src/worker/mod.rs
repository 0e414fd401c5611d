//! Workers and the machinery that runs tasks on them.
//!
//! - [`Worker`]: capability contract (match, state, execute, metadata)
//! - [`kinds`]: match-any and capability-matching workers
//! - [`WorkerPool`]: the set of workers a queue schedules onto
//! - [`executor`]: the remote script-execution protocol shared by every backend
//! - [`ExecutionBroker`]: runs allocated tasks concurrently and reconciles state
//! - [`provision`]: builds workers from a pool configuration
//!
//! # Execution Flow
//!
//! 1. The scheduler flips a worker IDLE -> ALLOCATED and hands it to the broker
//! 2. The broker spawns [`Worker::execute`], which delegates to a [`TaskExecutor`]
//! 3. The executor acquires the target, stages the runner and script, launches it
//!    and polls exit codes until every command is reconciled
//! 4. The broker records the task outcome and flips the worker back to IDLE

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;

use crate::scheduler::job::Task;
use crate::scheduler::requirements::Requirements;

pub mod broker;
pub mod executor;
pub mod kinds;
pub mod pool;
pub mod provision;

pub use broker::ExecutionBroker;
pub use executor::{ScriptExecutor, TaskExecutionResult, TaskExecutor, TaskOutcome};
pub use kinds::{CapabilityWorker, MatchAnyWorker};
pub use pool::WorkerPool;
pub use provision::{build_pool, build_workers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Allocated,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Allocated => write!(f, "allocated"),
        }
    }
}

/// An execution target able to run a task's commands.
#[async_trait]
pub trait Worker: Send + Sync + std::fmt::Debug + std::fmt::Display {
    fn id(&self) -> &str;

    fn pool_id(&self) -> u32;

    fn state(&self) -> WorkerState;

    /// Move IDLE -> ALLOCATED. Returns false if the worker was not idle.
    fn try_allocate(&self) -> bool;

    /// Move back to IDLE.
    fn release(&self);

    fn matches(&self, requirements: &Requirements) -> bool;

    fn metadata(&self) -> BTreeMap<String, String>;

    async fn execute(&self, task: &Task) -> TaskExecutionResult;
}

/// IDLE/ALLOCATED flag with an atomic allocate transition.
#[derive(Debug, Default)]
pub struct Allocation(AtomicBool);

impl Allocation {
    pub fn state(&self) -> WorkerState {
        if self.0.load(Ordering::Acquire) {
            WorkerState::Allocated
        } else {
            WorkerState::Idle
        }
    }

    pub fn try_allocate(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}
