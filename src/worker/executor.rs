use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::{DroverError, Result};
use crate::scheduler::job::{aggregate_commands, Command, CommandState, Task, TaskState};
use crate::transport::{shell_quote, Transport};

/// Script staged on every target; runs a task script line by line and records exit codes.
pub const RUNNER_SCRIPT: &str = include_str!("runner.sh");
pub const RUNNER_FILE_NAME: &str = "drover-runner.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Success,
    Failure,
}

/// Result of running a task on a worker
#[derive(Debug, Clone)]
pub struct TaskExecutionResult {
    pub task_id: Uuid,
    pub outcome: TaskOutcome,
    pub exit_codes: Vec<Option<i32>>,
}

impl TaskExecutionResult {
    /// SUCCESS iff no command failed.
    pub fn from_commands(task_id: Uuid, commands: &[Command]) -> Self {
        let outcome = match aggregate_commands(commands) {
            TaskState::Failed => TaskOutcome::Failure,
            _ => TaskOutcome::Success,
        };
        Self {
            task_id,
            outcome,
            exit_codes: commands.iter().map(|c| c.exit_code).collect(),
        }
    }

    pub fn failure(task_id: Uuid, commands: &[Command]) -> Self {
        Self {
            task_id,
            outcome: TaskOutcome::Failure,
            exit_codes: commands.iter().map(|c| c.exit_code).collect(),
        }
    }

    pub fn task_state(&self) -> TaskState {
        match self.outcome {
            TaskOutcome::Success => TaskState::Finished,
            TaskOutcome::Failure => TaskState::Failed,
        }
    }
}

/// Runs one task's commands against one execution target.
#[async_trait]
pub trait TaskExecutor: Send + Sync + std::fmt::Debug + std::fmt::Display {
    async fn execute(&self, task: &Task) -> TaskExecutionResult;

    fn metadata(&self) -> BTreeMap<String, String>;
}

/// Target-side files used while running one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPaths {
    pub work_dir: String,
    pub runner: String,
    pub script: String,
    pub results: String,
    pub log: String,
}

impl ScriptPaths {
    pub fn new(work_dir: &str, task_id: Uuid) -> Self {
        let dir = work_dir.trim_end_matches('/');
        let dir = if dir.is_empty() { "/" } else { dir };
        let join = |name: String| {
            if dir == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", dir, name)
            }
        };
        Self {
            work_dir: dir.to_string(),
            runner: join(RUNNER_FILE_NAME.to_string()),
            script: join(format!("{}.ts", task_id)),
            results: join(format!("{}.ec", task_id)),
            log: join(format!("{}.log", task_id)),
        }
    }
}

/// Parse a results file into one entry per complete line.
///
/// A trailing fragment without a newline is still being written and is left
/// out. Lines that do not hold an integer, or hold the `undetermined` sentinel,
/// map to `None`.
pub fn parse_exit_codes(content: &str, undetermined: i32) -> Vec<Option<i32>> {
    let complete = match content.rfind('\n') {
        Some(end) => &content[..=end],
        None => "",
    };
    complete
        .lines()
        .map(|line| {
            line.trim()
                .parse::<i32>()
                .ok()
                .filter(|code| *code != undetermined)
        })
        .collect()
}

/// The remote execution protocol, shared by every backend.
///
/// 1. acquire the target
/// 2. stage the runner script
/// 3. stage the task script, one remote append per command
/// 4. launch the runner detached
/// 5. poll the results file until every command is reconciled or one failed
/// 6. release the target
/// 7. aggregate the outcome
#[derive(Debug)]
pub struct ScriptExecutor<T> {
    transport: T,
    config: ExecutorConfig,
}

impl<T: Transport> ScriptExecutor<T> {
    pub fn new(transport: T, config: ExecutorConfig) -> Self {
        Self { transport, config }
    }

    async fn exec_checked(&self, command: String) -> Result<()> {
        let out = self.transport.exec(&command).await?;
        if out.success() {
            Ok(())
        } else {
            Err(DroverError::CommandFailed {
                command,
                exit_code: out.exit_code,
            })
        }
    }

    async fn stage_runner(&self, task_id: Uuid, paths: &ScriptPaths) -> Result<()> {
        tracing::debug!(task_id = %task_id, target = %self.transport, path = %paths.runner, "Staging runner");
        // Write under a per-task name then rename, so a runner already executing
        // for another task on the same target is never truncated under it
        let staging = format!("{}.{}", paths.runner, task_id);
        self.exec_checked(format!(
            "mkdir -p {dir} && printf '%s' {body} > {tmp} && mv -f {tmp} {runner}",
            dir = shell_quote(&paths.work_dir),
            body = shell_quote(RUNNER_SCRIPT),
            tmp = shell_quote(&staging),
            runner = shell_quote(&paths.runner),
        ))
        .await
        .map_err(|e| DroverError::Staging(format!("runner: {}", e)))
    }

    async fn stage_script(&self, task: &Task, paths: &ScriptPaths) -> Result<()> {
        let lines = task.command_lines().await;
        tracing::debug!(task_id = %task.id(), commands = lines.len(), path = %paths.script, "Staging task script");

        self.exec_checked(format!(
            "rm -f {} {} {}",
            shell_quote(&paths.script),
            shell_quote(&paths.results),
            shell_quote(&paths.log)
        ))
        .await
        .map_err(|e| DroverError::Staging(format!("clearing previous run: {}", e)))?;

        for (index, line) in lines.iter().enumerate() {
            self.exec_checked(format!(
                "printf '%s\\n' {} >> {}",
                shell_quote(line),
                shell_quote(&paths.script)
            ))
            .await
            .map_err(|e| DroverError::Staging(format!("command {}: {}", index, e)))?;
        }
        Ok(())
    }

    async fn launch(&self, paths: &ScriptPaths) -> Result<()> {
        let command = format!(
            "sh {} {} {} {}",
            shell_quote(&paths.runner),
            shell_quote(&paths.script),
            shell_quote(&paths.results),
            shell_quote(&paths.log)
        );
        self.transport
            .spawn(&command)
            .await
            .map_err(|e| DroverError::Staging(format!("launch: {}", e)))
    }

    async fn read_results(&self, task_id: Uuid, paths: &ScriptPaths) -> Vec<Option<i32>> {
        match self
            .transport
            .exec(&format!("cat {}", shell_quote(&paths.results)))
            .await
        {
            Ok(out) if out.success() => {
                parse_exit_codes(&out.stdout, self.config.undetermined_exit_code)
            }
            // Results file not created yet: no command has finished
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::warn!(task_id = %task_id, target = %self.transport, error = %e, "Failed to read results file");
                Vec::new()
            }
        }
    }

    /// Reconcile commands with the results file, strictly in order.
    async fn poll_results(&self, task: &Task, paths: &ScriptPaths) {
        let task_id = task.id();
        let total = task.len().await;
        let mut next = 0;

        while next < total {
            let exit_codes = self.read_results(task_id, paths).await;

            while next < total {
                let Some(exit_code) = exit_codes.get(next).copied().flatten() else {
                    break;
                };
                let state = task.record_exit_code(next, exit_code).await;
                tracing::debug!(task_id = %task_id, index = next, exit_code, "Command completed");
                next += 1;

                if state == Some(CommandState::Failed) {
                    // The runner stops at the first failure
                    task.unstart_from(next).await;
                    return;
                }
            }

            if next < total {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }
}

#[async_trait]
impl<T: Transport> TaskExecutor for ScriptExecutor<T> {
    async fn execute(&self, task: &Task) -> TaskExecutionResult {
        let task_id = task.id();
        tracing::info!(task_id = %task_id, target = %self.transport, "Executing task");

        if let Err(e) = self.transport.acquire(task).await {
            tracing::warn!(task_id = %task_id, target = %self.transport, error = %e, "Failed to acquire target, task failed");
            return TaskExecutionResult::failure(task_id, &task.commands().await);
        }

        let paths = ScriptPaths::new(&self.config.work_dir, task_id);
        let staged = match self.stage_runner(task_id, &paths).await {
            Ok(()) => self.stage_script(task, &paths).await,
            Err(e) => Err(e),
        };
        match staged {
            Ok(()) => match self.launch(&paths).await {
                Ok(()) => {
                    task.mark_commands_running().await;
                    self.poll_results(task, &paths).await;
                }
                Err(e) => {
                    tracing::error!(task_id = %task_id, target = %self.transport, error = %e, "Launch failed");
                    task.fail_all_commands().await;
                }
            },
            Err(e) => {
                tracing::error!(task_id = %task_id, target = %self.transport, error = %e, "Staging failed");
                task.fail_all_commands().await;
            }
        }

        if let Err(e) = self.transport.release().await {
            tracing::error!(task_id = %task_id, target = %self.transport, error = %e, "Failed to release target");
        }

        let result = TaskExecutionResult::from_commands(task_id, &task.commands().await);
        tracing::info!(
            task_id = %task_id,
            outcome = ?result.outcome,
            exit_codes = ?result.exit_codes,
            "Task completed"
        );
        result
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = self.transport.metadata();
        metadata.insert("work_dir".to_string(), self.config.work_dir.clone());
        metadata.insert(
            "poll_interval_ms".to_string(),
            self.config.poll_interval.as_millis().to_string(),
        );
        metadata
    }
}

impl<T: Transport> std::fmt::Display for ScriptExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.transport)
    }
}
