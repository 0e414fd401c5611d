use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DroverError, Result};

/// Sandbox settings for container workers.
///
/// Every container runs with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities and no-new-privileges
/// - Read-only root filesystem with a writable tmpfs for the executor work dir
/// - Memory and CPU limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Docker image the worker containers are started from
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// Settings for workers backed by pods pinned to cluster nodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub namespace: String,
    pub image: String,
    /// Passed to kubectl as `--kubeconfig` when set
    pub kubeconfig: Option<PathBuf>,
    /// How long to wait for a worker pod to become ready
    pub ready_timeout_secs: u64,
    /// kubectl binary to invoke
    pub kubectl: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            image: "alpine:latest".to_string(),
            kubeconfig: None,
            ready_timeout_secs: 120,
            kubectl: "kubectl".to_string(),
        }
    }
}

/// Settings of the remote execution protocol.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Delay between two reads of a task's results file
    pub poll_interval: Duration,
    /// A results line holding this value means "not written yet"
    pub undetermined_exit_code: i32,
    /// Target-side directory for the runner, scripts and results files
    pub work_dir: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            undetermined_exit_code: i32::MAX,
            work_dir: "/tmp".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = work_dir.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queue_id: String,
    pub queue_name: String,
    pub scheduler_period: Duration,
    pub executor: ExecutorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_id: "default".to_string(),
            queue_name: "Default Queue".to_string(),
            scheduler_period: Duration::from_millis(5000),
            executor: ExecutorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_scheduler_period(mut self, period: Duration) -> Self {
        self.scheduler_period = period;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    Raw,
    Docker,
    Kubernetes,
}

impl std::fmt::Display for PoolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolType::Raw => write!(f, "raw"),
            PoolType::Docker => write!(f, "docker"),
            PoolType::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// One machine contributing workers to a pool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeSpec {
    /// ssh host (raw), docker daemon address (docker) or node name (kubernetes).
    /// Raw nodes without an address run commands on the local machine.
    #[serde(default)]
    pub address: Option<String>,
    /// Capability values the node's workers declare, e.g. `{"cpu": "4"}`
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_pool_id() -> u32 {
    1
}

fn default_workers_per_node() -> usize {
    1
}

/// Pool file loaded at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_id")]
    pub pool_id: u32,
    pub pool_type: PoolType,
    #[serde(default = "default_workers_per_node")]
    pub workers_per_node: usize,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl PoolConfig {
    pub fn new(pool_type: PoolType) -> Self {
        Self {
            pool_id: default_pool_id(),
            pool_type,
            workers_per_node: default_workers_per_node(),
            nodes: Vec::new(),
            sandbox: SandboxConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_workers_per_node(mut self, workers_per_node: usize) -> Self {
        self.workers_per_node = workers_per_node;
        self
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(DroverError::Config("pool has no nodes".to_string()));
        }
        if self.workers_per_node == 0 {
            return Err(DroverError::Config(
                "workers_per_node must be at least 1".to_string(),
            ));
        }
        if self.pool_type == PoolType::Kubernetes && self.nodes.iter().any(|n| n.address.is_none())
        {
            return Err(DroverError::Config(
                "kubernetes nodes need an address (node name)".to_string(),
            ));
        }
        if self.pool_type == PoolType::Docker && self.sandbox.image.trim().is_empty() {
            return Err(DroverError::Config("docker image may not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.image, "alpine:latest");
        assert!(cfg.network_disabled);
        assert_eq!(cfg.memory_limit.as_deref(), Some("256m"));
        assert_eq!(cfg.cpu_limit.as_deref(), Some("0.5"));
    }

    #[test]
    fn executor_config_default() {
        let cfg = ExecutorConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.undetermined_exit_code, i32::MAX);
        assert_eq!(cfg.work_dir, "/tmp");
    }

    #[test]
    fn engine_config_default() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.queue_id, "default");
        assert_eq!(cfg.queue_name, "Default Queue");
        assert_eq!(cfg.scheduler_period, Duration::from_secs(5));
    }

    #[test]
    fn engine_config_builders() {
        let cfg = EngineConfig::default()
            .with_scheduler_period(Duration::from_millis(10))
            .with_executor(ExecutorConfig::default().with_work_dir("/var/tmp"));
        assert_eq!(cfg.scheduler_period, Duration::from_millis(10));
        assert_eq!(cfg.executor.work_dir, "/var/tmp");
    }

    #[test]
    fn pool_config_parses_raw_pool() {
        let cfg = PoolConfig::from_json(
            r#"{
                "pool_type": "raw",
                "workers_per_node": 5,
                "nodes": [{}, {"address": "build-01", "tags": {"cpu": "4"}}]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.pool_id, 1);
        assert_eq!(cfg.pool_type, PoolType::Raw);
        assert_eq!(cfg.workers_per_node, 5);
        assert_eq!(cfg.nodes.len(), 2);
        assert!(cfg.nodes[0].address.is_none());
        assert_eq!(cfg.nodes[1].tags.get("cpu").map(String::as_str), Some("4"));
    }

    #[test]
    fn pool_config_parses_docker_sandbox_overrides() {
        let cfg = PoolConfig::from_json(
            r#"{
                "pool_type": "docker",
                "nodes": [{"address": "unix:///var/run/docker.sock"}],
                "sandbox": {"image": "ubuntu:22.04", "memory_limit": null}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.sandbox.image, "ubuntu:22.04");
        assert!(cfg.sandbox.memory_limit.is_none());
        // untouched fields keep their defaults
        assert!(cfg.sandbox.network_disabled);
    }

    #[test]
    fn pool_config_rejects_unknown_pool_type() {
        let result = PoolConfig::from_json(r#"{"pool_type": "vm", "nodes": [{}]}"#);
        assert!(matches!(result, Err(DroverError::Json(_))));
    }

    #[test]
    fn pool_config_rejects_empty_pool() {
        let result = PoolConfig::from_json(r#"{"pool_type": "raw"}"#);
        assert!(matches!(result, Err(DroverError::Config(_))));
    }

    #[test]
    fn pool_config_rejects_kubernetes_node_without_name() {
        let cfg = PoolConfig::new(PoolType::Kubernetes).with_node(NodeSpec::default());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pool_config_rejects_zero_workers() {
        let cfg = PoolConfig::new(PoolType::Raw)
            .with_node(NodeSpec::default())
            .with_workers_per_node(0);
        assert!(cfg.validate().is_err());
    }
}
