use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{DroverError, Result};
use crate::scheduler::requirements::Requirements;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Unstarted,
    Running,
    Finished,
    Failed,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Finished | CommandState::Failed)
    }
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandState::Unstarted => write!(f, "unstarted"),
            CommandState::Running => write!(f, "running"),
            CommandState::Finished => write!(f, "finished"),
            CommandState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Finished,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Finished => write!(f, "finished"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Submitted,
    Queued,
    Running,
    Finished,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Submitted => write!(f, "submitted"),
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Finished => write!(f, "finished"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// One shell instruction of a task. `exit_code` is `None` until observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    pub state: CommandState,
    pub exit_code: Option<i32>,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            state: CommandState::Unstarted,
            exit_code: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = CommandState::Unstarted;
        self.exit_code = None;
    }
}

/// State a task would have if it were derived purely from its commands.
pub fn aggregate_commands(commands: &[Command]) -> TaskState {
    if commands.iter().any(|c| c.state == CommandState::Failed) {
        TaskState::Failed
    } else if commands.iter().all(|c| c.state == CommandState::Finished) {
        TaskState::Finished
    } else if commands.iter().all(|c| c.state == CommandState::Unstarted) {
        TaskState::Pending
    } else {
        TaskState::Running
    }
}

/// Job state rolled up from its tasks, once the job has been queued.
pub fn aggregate_tasks(states: &[TaskState]) -> JobState {
    if states.contains(&TaskState::Failed) {
        JobState::Failed
    } else if states.iter().all(|s| *s == TaskState::Finished) {
        JobState::Finished
    } else if states.iter().all(|s| *s == TaskState::Pending) {
        JobState::Queued
    } else {
        JobState::Running
    }
}

#[derive(Debug, Clone)]
struct TaskProgress {
    state: TaskState,
    commands: Vec<Command>,
}

/// The unit of scheduling.
///
/// Identity and requirements never change, so they live outside the lock and
/// the policy can read them without awaiting. Command progress is written by the
/// executor that owns the task while it runs.
#[derive(Debug)]
pub struct Task {
    id: Uuid,
    requirements: Requirements,
    progress: RwLock<TaskProgress>,
}

impl Task {
    pub fn new(commands: Vec<String>, requirements: Requirements) -> Self {
        Self::with_id(Uuid::new_v4(), commands, requirements)
    }

    pub fn with_id(id: Uuid, commands: Vec<String>, requirements: Requirements) -> Self {
        Self {
            id,
            requirements,
            progress: RwLock::new(TaskProgress {
                state: TaskState::Pending,
                commands: commands.into_iter().map(Command::new).collect(),
            }),
        }
    }

    pub fn from_spec(spec: TaskSpec) -> Result<Self> {
        let commands = spec.commands.ok_or_else(|| {
            DroverError::InvalidTaskSpec("commands list may not be absent".to_string())
        })?;
        // The staged script holds one command per line.
        if let Some(bad) = commands.iter().find(|c| c.contains('\n')) {
            return Err(DroverError::InvalidTaskSpec(format!(
                "command spans multiple lines: {bad:?}"
            )));
        }
        let requirements = Requirements::parse(spec.requirements)?;
        Ok(Self::new(commands, requirements))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    pub async fn state(&self) -> TaskState {
        self.progress.read().await.state
    }

    pub async fn set_state(&self, state: TaskState) {
        self.progress.write().await.state = state;
    }

    pub async fn commands(&self) -> Vec<Command> {
        self.progress.read().await.commands.clone()
    }

    pub async fn command_lines(&self) -> Vec<String> {
        self.progress
            .read()
            .await
            .commands
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.progress.read().await.commands.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn mark_commands_running(&self) {
        let mut progress = self.progress.write().await;
        for command in progress.commands.iter_mut() {
            command.state = CommandState::Running;
        }
    }

    /// Staging failed: nothing ran, nothing can be known about exit codes.
    pub async fn fail_all_commands(&self) {
        let mut progress = self.progress.write().await;
        for command in progress.commands.iter_mut() {
            command.state = CommandState::Failed;
            command.exit_code = None;
        }
    }

    /// Record the observed exit code of command `index` and return its new state.
    pub async fn record_exit_code(&self, index: usize, exit_code: i32) -> Option<CommandState> {
        let mut progress = self.progress.write().await;
        let command = progress.commands.get_mut(index)?;
        command.state = if exit_code == 0 {
            CommandState::Finished
        } else {
            CommandState::Failed
        };
        command.exit_code = Some(exit_code);
        Some(command.state)
    }

    /// Commands from `index` on were never started by the runner.
    pub async fn unstart_from(&self, index: usize) {
        let mut progress = self.progress.write().await;
        for command in progress.commands.iter_mut().skip(index) {
            command.reset();
        }
    }

    pub async fn reset(&self) {
        let mut progress = self.progress.write().await;
        progress.state = TaskState::Pending;
        for command in progress.commands.iter_mut() {
            command.reset();
        }
    }

    pub async fn snapshot(&self) -> TaskSnapshot {
        let progress = self.progress.read().await;
        TaskSnapshot {
            id: self.id,
            state: progress.state,
            commands: progress.commands.clone(),
            requirements: self.requirements.raw().clone(),
        }
    }

    pub fn restore(snap: TaskSnapshot) -> Result<Self> {
        Ok(Self {
            id: snap.id,
            requirements: Requirements::parse(snap.requirements)?,
            progress: RwLock::new(TaskProgress {
                state: snap.state,
                commands: snap.commands,
            }),
        })
    }
}

/// A named unit of submitted work. The task collection is fixed at creation.
#[derive(Debug)]
pub struct Job {
    id: Uuid,
    label: String,
    created_at: DateTime<Utc>,
    tasks: Vec<Arc<Task>>,
    // Only Submitted or Queued are stored; everything later is derived.
    admission: RwLock<JobState>,
}

impl Job {
    pub fn new(label: impl Into<String>, tasks: Vec<Arc<Task>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            created_at: Utc::now(),
            tasks,
            admission: RwLock::new(JobState::Submitted),
        }
    }

    /// Build a job from a submitted spec. Rejects tasks whose command list is absent.
    pub fn from_spec(spec: JobSpec) -> Result<Self> {
        let tasks = spec
            .tasks
            .into_iter()
            .map(|t| Task::from_spec(t).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let job = Self::new(spec.label, tasks);
        tracing::debug!(job_id = %job.id, label = %job.label, tasks = job.tasks.len(), "Job created from spec");
        Ok(job)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub async fn mark_queued(&self) {
        *self.admission.write().await = JobState::Queued;
    }

    pub async fn state(&self) -> JobState {
        if *self.admission.read().await == JobState::Submitted {
            return JobState::Submitted;
        }
        let mut states = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            states.push(task.state().await);
        }
        aggregate_tasks(&states)
    }

    pub async fn has_unfinished_task(&self) -> bool {
        for task in &self.tasks {
            if !task.state().await.is_terminal() {
                return true;
            }
        }
        false
    }

    /// Put every task and command back to its initial state and mark the job queued.
    pub async fn reset(&self) {
        for task in &self.tasks {
            task.reset().await;
        }
        self.mark_queued().await;
    }

    pub async fn snapshot(&self) -> JobSnapshot {
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            tasks.push(task.snapshot().await);
        }
        JobSnapshot {
            id: self.id,
            label: self.label.clone(),
            state: self.state().await,
            created_at: self.created_at,
            tasks,
        }
    }

    pub fn restore(snap: JobSnapshot) -> Result<Self> {
        let tasks = snap
            .tasks
            .into_iter()
            .map(|t| Task::restore(t).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let admission = if snap.state == JobState::Submitted {
            JobState::Submitted
        } else {
            JobState::Queued
        };
        Ok(Self {
            id: snap.id,
            label: snap.label,
            created_at: snap.created_at,
            tasks,
            admission: RwLock::new(admission),
        })
    }
}

/// Submitted description of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub label: String,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub commands: Option<Vec<String>>,
    #[serde(default)]
    pub requirements: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub state: TaskState,
    pub commands: Vec<Command>,
    #[serde(default)]
    pub requirements: BTreeMap<String, String>,
}

/// Serializable image of a job for an external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub label: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub tasks: Vec<TaskSnapshot>,
}
