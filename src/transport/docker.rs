use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::{DroverError, Result};
use crate::scheduler::job::Task;
use crate::transport::{run_process, ExecOutput, Transport};

/// Task clause overriding the container memory limit.
pub const DOCKER_MEMORY: &str = "docker-memory";
/// Task clause setting the container's relative CPU weight.
pub const DOCKER_CPU_WEIGHT: &str = "docker-cpu-weight";
/// Task clause choosing the container image; the sandbox image is the fallback.
pub const DOCKER_IMAGE: &str = "image";

/// Container transport driving the Docker CLI.
///
/// One container per task execution: started on acquire with the sandbox
/// settings, used through `docker exec`, removed on release.
#[derive(Debug)]
pub struct DockerTransport {
    container: String,
    docker_host: Option<String>,
    sandbox: SandboxConfig,
    work_dir: String,
    started: AtomicBool,
}

impl DockerTransport {
    pub fn new(
        container: impl Into<String>,
        docker_host: Option<String>,
        sandbox: SandboxConfig,
        work_dir: impl Into<String>,
    ) -> Self {
        Self {
            container: container.into(),
            docker_host,
            sandbox,
            work_dir: work_dir.into(),
            started: AtomicBool::new(false),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Image the container for `task` is started from.
    pub fn image_for(&self, task: &Task) -> String {
        task.requirements()
            .clauses()
            .iter()
            .find(|c| c.key == DOCKER_IMAGE)
            .map(|c| c.value.clone())
            .unwrap_or_else(|| self.sandbox.image.clone())
    }

    fn docker_args(&self) -> Vec<String> {
        match &self.docker_host {
            Some(host) => vec!["-H".to_string(), host.clone()],
            None => Vec::new(),
        }
    }

    /// Arguments of the `docker run` that starts the worker container for `task`.
    pub fn run_args(&self, task: &Task) -> Vec<String> {
        let mut args = self.docker_args();
        args.extend([
            "run".to_string(),
            "-d".to_string(),
            format!("--name={}", self.container),
        ]);

        // Network isolation
        if self.sandbox.network_disabled {
            args.push("--network=none".to_string());
        }

        // Memory limit, the task may ask for a different one
        let memory = task
            .requirements()
            .clauses()
            .iter()
            .find(|c| c.key == DOCKER_MEMORY)
            .map(|c| c.value.clone())
            .or_else(|| self.sandbox.memory_limit.clone());
        if let Some(limit) = memory {
            args.push(format!("--memory={}", limit));
        }

        // CPU limit
        if let Some(ref limit) = self.sandbox.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }
        if let Some(weight) = task
            .requirements()
            .clauses()
            .iter()
            .find(|c| c.key == DOCKER_CPU_WEIGHT)
        {
            args.push(format!("--cpu-shares={}", weight.value));
        }

        // Security: drop all capabilities, no new privileges
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());

        // Read-only root filesystem, scripts and results go to a tmpfs
        args.push("--read-only".to_string());
        args.push(format!("--tmpfs={}", self.work_dir));

        // Keep the container alive until release
        args.push("--entrypoint=tail".to_string());
        args.push(self.image_for(task));
        args.push("-f".to_string());
        args.push("/dev/null".to_string());
        args
    }

    async fn remove_container(&self) -> Result<ExecOutput> {
        let mut args = self.docker_args();
        args.extend(["rm".to_string(), "-f".to_string(), self.container.clone()]);
        run_process("docker", &args).await
    }
}

#[async_trait]
impl Transport for DockerTransport {
    async fn acquire(&self, task: &Task) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(DroverError::Acquire(format!(
                "container {} was already started",
                self.container
            )));
        }

        // A container left behind by a failed release would block the name
        if let Ok(out) = self.remove_container().await {
            if out.success() {
                tracing::debug!(container = %self.container, "Removed stale container");
            }
        }

        tracing::info!(task_id = %task.id(), container = %self.container, image = %self.image_for(task), "Starting container");
        let out = run_process("docker", &self.run_args(task))
            .await
            .map_err(|e| DroverError::Acquire(e.to_string()))?;
        if !out.success() {
            return Err(DroverError::Acquire(format!(
                "docker run for {} exited with {:?}: {}",
                self.container,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut args = self.docker_args();
        args.extend([
            "exec".to_string(),
            self.container.clone(),
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);
        run_process("docker", &args).await
    }

    async fn spawn(&self, command: &str) -> Result<()> {
        let mut args = self.docker_args();
        args.extend([
            "exec".to_string(),
            "-d".to_string(),
            self.container.clone(),
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);
        let out = run_process("docker", &args).await?;
        if out.success() {
            Ok(())
        } else {
            Err(DroverError::CommandFailed {
                command: command.to_string(),
                exit_code: out.exit_code,
            })
        }
    }

    async fn release(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::AcqRel) {
            return Err(DroverError::CommandFailed {
                command: format!("docker rm -f {}", self.container),
                exit_code: None,
            });
        }
        tracing::info!(container = %self.container, "Stopping container");
        let out = self.remove_container().await?;
        if out.success() {
            Ok(())
        } else {
            Err(DroverError::CommandFailed {
                command: format!("docker rm -f {}", self.container),
                exit_code: out.exit_code,
            })
        }
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::from([
            ("backend".to_string(), "docker".to_string()),
            ("container".to_string(), self.container.clone()),
            ("image".to_string(), self.sandbox.image.clone()),
        ]);
        if let Some(host) = &self.docker_host {
            metadata.insert("docker_host".to_string(), host.clone());
        }
        metadata
    }
}

impl std::fmt::Display for DockerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.docker_host {
            Some(host) => write!(f, "docker:{}@{}", self.container, host),
            None => write!(f, "docker:{}", self.container),
        }
    }
}
