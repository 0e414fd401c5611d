use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::ClusterConfig;
use crate::error::{DroverError, Result};
use crate::scheduler::job::Task;
use crate::transport::{run_process, shell_quote, ExecOutput, Transport};

/// Task clause requesting CPU for the worker pod.
pub const K8S_CPU: &str = "k8s-cpu";
/// Task clause requesting memory for the worker pod.
pub const K8S_MEMORY: &str = "k8s-memory";

const NODE_LABEL: &str = "kubernetes.io/hostname";

/// Cluster-node transport: a pod pinned to one node, driven through `kubectl`.
#[derive(Debug)]
pub struct KubeTransport {
    pod: String,
    node: String,
    cluster: ClusterConfig,
    started: AtomicBool,
}

impl KubeTransport {
    pub fn new(pod: impl Into<String>, node: impl Into<String>, cluster: ClusterConfig) -> Self {
        Self {
            pod: pod.into(),
            node: node.into(),
            cluster,
            started: AtomicBool::new(false),
        }
    }

    fn kubectl_args(&self) -> Vec<String> {
        let mut args = vec!["--namespace".to_string(), self.cluster.namespace.clone()];
        if let Some(path) = &self.cluster.kubeconfig {
            args.push(format!("--kubeconfig={}", path.display()));
        }
        args
    }

    /// Pod overrides pinning the pod to its node and carrying the task's resource requests.
    pub fn overrides(&self, task: &Task) -> Value {
        let mut requests = Map::new();
        for clause in task.requirements().clauses() {
            match clause.key.as_str() {
                K8S_CPU => {
                    requests.insert("cpu".to_string(), Value::String(clause.value.clone()));
                }
                K8S_MEMORY => {
                    requests.insert("memory".to_string(), Value::String(clause.value.clone()));
                }
                _ => {}
            }
        }

        let mut spec = json!({
            "nodeSelector": { NODE_LABEL: self.node },
        });
        if !requests.is_empty() {
            spec["containers"] = json!([{
                "name": self.pod,
                "image": self.cluster.image,
                "command": ["tail", "-f", "/dev/null"],
                "resources": { "requests": requests },
            }]);
        }
        json!({ "apiVersion": "v1", "spec": spec })
    }

    pub fn run_args(&self, task: &Task) -> Vec<String> {
        let mut args = self.kubectl_args();
        args.extend([
            "run".to_string(),
            self.pod.clone(),
            format!("--image={}", self.cluster.image),
            "--restart=Never".to_string(),
            format!("--overrides={}", self.overrides(task)),
            "--command".to_string(),
            "--".to_string(),
            "tail".to_string(),
            "-f".to_string(),
            "/dev/null".to_string(),
        ]);
        args
    }

    async fn kubectl(&self, extra: &[String]) -> Result<ExecOutput> {
        let mut args = self.kubectl_args();
        args.extend_from_slice(extra);
        run_process(&self.cluster.kubectl, &args).await
    }

    async fn delete_pod(&self, wait: bool) -> Result<ExecOutput> {
        self.kubectl(&[
            "delete".to_string(),
            "pod".to_string(),
            self.pod.clone(),
            "--ignore-not-found".to_string(),
            format!("--wait={}", wait),
        ])
        .await
    }

    async fn wait_ready(&self) -> Result<()> {
        let ready = self
            .kubectl(&[
                "wait".to_string(),
                "--for=condition=Ready".to_string(),
                format!("pod/{}", self.pod),
                format!("--timeout={}s", self.cluster.ready_timeout_secs),
            ])
            .await
            .map_err(|e| DroverError::Acquire(e.to_string()))?;
        if !ready.success() {
            return Err(DroverError::Acquire(format!(
                "pod {} did not become ready: {}",
                self.pod,
                ready.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Delete the pod without reporting errors, for paths that already failed.
    async fn discard_pod(&self, wait: bool) {
        match self.delete_pod(wait).await {
            Ok(out) if out.success() => {
                tracing::debug!(pod = %self.pod, "Discarded worker pod");
            }
            Ok(out) => {
                tracing::warn!(pod = %self.pod, exit_code = ?out.exit_code, stderr = %out.stderr.trim(), "Failed to delete worker pod");
            }
            Err(e) => {
                tracing::warn!(pod = %self.pod, error = %e, "Failed to delete worker pod");
            }
        }
    }
}

#[async_trait]
impl Transport for KubeTransport {
    async fn acquire(&self, task: &Task) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(DroverError::Acquire(format!(
                "pod {} was already started",
                self.pod
            )));
        }
        // Clear a pod left behind by an earlier failed release
        self.discard_pod(true).await;

        tracing::info!(task_id = %task.id(), pod = %self.pod, node = %self.node, "Starting worker pod");
        let out = run_process(&self.cluster.kubectl, &self.run_args(task))
            .await
            .map_err(|e| DroverError::Acquire(e.to_string()))?;
        if !out.success() {
            return Err(DroverError::Acquire(format!(
                "kubectl run for {} exited with {:?}: {}",
                self.pod,
                out.exit_code,
                out.stderr.trim()
            )));
        }

        // The executor does not release after a failed acquire, so a pod that
        // never became ready is removed here.
        if let Err(e) = self.wait_ready().await {
            self.discard_pod(false).await;
            return Err(e);
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.kubectl(&[
            "exec".to_string(),
            self.pod.clone(),
            "--".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ])
        .await
    }

    async fn spawn(&self, command: &str) -> Result<()> {
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

    async fn release(&self) -> Result<()> {
        self.started.store(false, Ordering::Release);
        tracing::info!(pod = %self.pod, "Deleting worker pod");
        let out = self.delete_pod(false).await?;
        if out.success() {
            Ok(())
        } else {
            Err(DroverError::CommandFailed {
                command: format!("kubectl delete pod {}", self.pod),
                exit_code: out.exit_code,
            })
        }
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("backend".to_string(), "kubernetes".to_string()),
            ("pod".to_string(), self.pod.clone()),
            ("node".to_string(), self.node.clone()),
            ("namespace".to_string(), self.cluster.namespace.clone()),
            ("image".to_string(), self.cluster.image.clone()),
        ])
    }
}

impl std::fmt::Display for KubeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kubernetes:{}/{}@{}",
            self.cluster.namespace, self.pod, self.node
        )
    }
}
