//! Remote transports the execution protocol is written against.
//!
//! A transport exposes four operations on one execution unit: start it, run a
//! command and learn its exit code, run a command detached, and stop it.
//! Backends shell out to the tools that control them (`sh`/`ssh`, `docker`,
//! `kubectl`) through `tokio::process`.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::Result;
use crate::scheduler::job::Task;

pub mod docker;
pub mod kube;
pub mod shell;

pub use docker::DockerTransport;
pub use kube::KubeTransport;
pub use shell::ShellTransport;

/// Outcome of a command run to completion on the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug + std::fmt::Display {
    /// Create and start the execution unit for `task`.
    async fn acquire(&self, task: &Task) -> Result<()>;

    /// Run `command` through `sh -c` on the unit and wait for it.
    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    /// Start `command` on the unit without waiting for it.
    async fn spawn(&self, command: &str) -> Result<()>;

    /// Stop and clean up the execution unit.
    async fn release(&self) -> Result<()>;

    fn metadata(&self) -> BTreeMap<String, String>;
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub(crate) async fn run_process(program: &str, args: &[String]) -> Result<ExecOutput> {
    tracing::trace!(program, ?args, "Running process");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    Ok(ExecOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
