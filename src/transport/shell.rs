use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{DroverError, Result};
use crate::scheduler::job::Task;
use crate::transport::{run_process, shell_quote, ExecOutput, Transport};

/// Raw host transport: `sh -c` on this machine, or over `ssh` when a host is set.
#[derive(Debug, Clone, Default)]
pub struct ShellTransport {
    host: Option<String>,
}

impl ShellTransport {
    pub fn local() -> Self {
        Self { host: None }
    }

    pub fn ssh(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
        }
    }

    /// `None`, `localhost` and `127.0.0.1` all mean this machine.
    pub fn for_address(address: Option<&str>) -> Self {
        match address {
            None | Some("localhost") | Some("127.0.0.1") | Some("") => Self::local(),
            Some(host) => Self::ssh(host),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn ssh_args(host: &str, command: &str) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            host.to_string(),
            format!("sh -c {}", shell_quote(command)),
        ]
    }
}

#[async_trait]
impl Transport for ShellTransport {
    async fn acquire(&self, task: &Task) -> Result<()> {
        let out = self.exec("true").await.map_err(|e| {
            DroverError::Acquire(format!("host {} unreachable: {}", self, e))
        })?;
        if !out.success() {
            return Err(DroverError::Acquire(format!(
                "host {} unreachable (exit code {:?}): {}",
                self,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        tracing::debug!(task_id = %task.id(), host = %self, "Host reachable");
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        match &self.host {
            None => run_process("sh", &["-c".to_string(), command.to_string()]).await,
            Some(host) => run_process("ssh", &Self::ssh_args(host, command)).await,
        }
    }

    async fn spawn(&self, command: &str) -> Result<()> {
        match &self.host {
            None => {
                let mut child = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()?;
                // Reap the child once it exits
                tokio::spawn(async move {
                    if let Err(e) = child.wait().await {
                        tracing::warn!(error = %e, "Failed to wait for detached process");
                    }
                });
                Ok(())
            }
            Some(_) => {
                let detached = format!("nohup sh -c {} >/dev/null 2>&1 &", shell_quote(command));
                let out = self.exec(&detached).await?;
                if out.success() {
                    Ok(())
                } else {
                    Err(DroverError::CommandFailed {
                        command: detached,
                        exit_code: out.exit_code,
                    })
                }
            }
        }
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("backend".to_string(), "raw".to_string()),
            (
                "host".to_string(),
                self.host.clone().unwrap_or_else(|| "localhost".to_string()),
            ),
        ])
    }
}

impl std::fmt::Display for ShellTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            None => write!(f, "raw:localhost"),
            Some(host) => write!(f, "raw:ssh://{}", host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_addresses_resolve_to_local() {
        assert!(ShellTransport::for_address(None).host().is_none());
        assert!(ShellTransport::for_address(Some("localhost")).host().is_none());
        assert_eq!(
            ShellTransport::for_address(Some("build-01")).host(),
            Some("build-01")
        );
    }

    #[test]
    fn ssh_args_quote_remote_command() {
        let args = ShellTransport::ssh_args("h", "echo 'x'");
        assert_eq!(args[2], "h");
        assert_eq!(args[3], r"sh -c 'echo '\''x'\'''");
    }

    #[tokio::test]
    async fn local_exec_reports_exit_code() {
        let transport = ShellTransport::local();
        let out = transport.exec("exit 7").await.unwrap();
        assert_eq!(out.exit_code, Some(7));
    }

    #[tokio::test]
    async fn local_spawn_does_not_wait() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("done");
        let transport = ShellTransport::local();

        let started = std::time::Instant::now();
        transport
            .spawn(&format!("sleep 1; touch {}", marker.display()))
            .await
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(900));
        assert!(!marker.exists());
    }
}
