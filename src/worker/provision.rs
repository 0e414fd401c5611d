use std::sync::Arc;

use crate::config::{ExecutorConfig, PoolConfig, PoolType};
use crate::error::Result;
use crate::scheduler::requirements::Capabilities;
use crate::transport::{DockerTransport, KubeTransport, ShellTransport};
use crate::worker::executor::{ScriptExecutor, TaskExecutor};
use crate::worker::kinds::{CapabilityWorker, MatchAnyWorker};
use crate::worker::{Worker, WorkerPool};

/// Clause keys cluster workers understand besides their node tags.
pub const KUBERNETES_DOMAIN: &[&str] = &["image", "node"];

/// Build the workers described by `config`.
///
/// Raw nodes without tags produce match-any workers; every other node produces
/// workers that match the clauses their capabilities recognize.
pub fn build_workers(
    config: &PoolConfig,
    executor: &ExecutorConfig,
) -> Result<Vec<Arc<dyn Worker>>> {
    config.validate()?;
    let mut workers: Vec<Arc<dyn Worker>> = Vec::new();

    for (node_index, node) in config.nodes.iter().enumerate() {
        for slot in 0..config.workers_per_node {
            let id = format!(
                "{}-{}-{}-{}",
                config.pool_type, config.pool_id, node_index, slot
            );
            let worker: Arc<dyn Worker> = match config.pool_type {
                PoolType::Raw => {
                    let transport = ShellTransport::for_address(node.address.as_deref());
                    let task_executor: Arc<dyn TaskExecutor> =
                        Arc::new(ScriptExecutor::new(transport, executor.clone()));
                    if node.tags.is_empty() {
                        Arc::new(MatchAnyWorker::new(id, config.pool_id, task_executor))
                    } else {
                        let capabilities =
                            Capabilities::new(Vec::<String>::new()).with_tags(&node.tags);
                        Arc::new(CapabilityWorker::new(
                            id,
                            config.pool_id,
                            capabilities,
                            task_executor,
                        ))
                    }
                }
                PoolType::Docker => {
                    let container = format!("drover-{}", id);
                    let transport = DockerTransport::new(
                        container,
                        node.address.clone(),
                        config.sandbox.clone(),
                        executor.work_dir.clone(),
                    );
                    // The image is chosen per task by the transport, not matched
                    let capabilities =
                        Capabilities::new(Vec::<String>::new()).with_tags(&node.tags);
                    Arc::new(CapabilityWorker::new(
                        id,
                        config.pool_id,
                        capabilities,
                        Arc::new(ScriptExecutor::new(transport, executor.clone())),
                    ))
                }
                PoolType::Kubernetes => {
                    // validate() guarantees kubernetes nodes have a name
                    let node_name = node.address.clone().unwrap_or_default();
                    let pod = format!("drover-{}", id);
                    let transport =
                        KubeTransport::new(pod, node_name.clone(), config.cluster.clone());
                    let capabilities = Capabilities::new(KUBERNETES_DOMAIN.iter().copied())
                        .with("image", config.cluster.image.clone())
                        .with("node", node_name)
                        .with_tags(&node.tags);
                    Arc::new(CapabilityWorker::new(
                        id,
                        config.pool_id,
                        capabilities,
                        Arc::new(ScriptExecutor::new(transport, executor.clone())),
                    ))
                }
            };
            workers.push(worker);
        }
    }

    tracing::info!(
        pool_id = config.pool_id,
        pool_type = %config.pool_type,
        workers = workers.len(),
        "Provisioned workers"
    );
    Ok(workers)
}

pub fn build_pool(config: &PoolConfig, executor: &ExecutorConfig) -> Result<WorkerPool> {
    let workers = build_workers(config, executor)?;
    let pool = WorkerPool::new(config.pool_id, workers);
    tracing::info!(pool = %pool, "Pool created");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::NodeSpec;
    use crate::scheduler::requirements::Requirements;
    use crate::worker::WorkerState;

    fn requirements(expression: &str) -> Requirements {
        Requirements::parse(BTreeMap::from([("r".to_string(), expression.to_string())])).unwrap()
    }

    #[test]
    fn raw_pool_without_tags_matches_anything() {
        let config = PoolConfig::new(PoolType::Raw)
            .with_node(NodeSpec::default())
            .with_workers_per_node(5);
        let workers = build_workers(&config, &ExecutorConfig::default()).unwrap();

        assert_eq!(workers.len(), 5);
        assert_eq!(workers[0].id(), "raw-1-0-0");
        assert_eq!(workers[4].id(), "raw-1-0-4");
        assert!(workers
            .iter()
            .all(|w| w.matches(&requirements("cpu==64 && gpu==yes"))));
        assert!(workers.iter().all(|w| w.state() == WorkerState::Idle));
    }

    #[test]
    fn tagged_raw_nodes_match_on_tags() {
        let config = PoolConfig::new(PoolType::Raw).with_node(NodeSpec {
            address: None,
            tags: BTreeMap::from([("cpu".to_string(), "2".to_string())]),
        });
        let workers = build_workers(&config, &ExecutorConfig::default()).unwrap();

        assert!(workers[0].matches(&requirements("cpu==2")));
        assert!(!workers[0].matches(&requirements("cpu==4")));
    }

    #[test]
    fn docker_workers_accept_any_image_and_match_tags() {
        let config = PoolConfig::new(PoolType::Docker).with_node(NodeSpec {
            address: None,
            tags: BTreeMap::from([("gpu".to_string(), "no".to_string())]),
        });
        let workers = build_workers(&config, &ExecutorConfig::default()).unwrap();
        let worker = &workers[0];

        assert!(worker.matches(&requirements("image==alpine:latest && node==n1")));
        assert!(worker.matches(&requirements("image==ubuntu")));
        assert!(!worker.matches(&requirements("image==ubuntu && gpu==yes")));
        assert_eq!(
            worker.metadata().get("container").map(String::as_str),
            Some("drover-docker-1-0-0")
        );
    }

    #[test]
    fn kubernetes_workers_match_their_node() {
        let config = PoolConfig::new(PoolType::Kubernetes).with_node(NodeSpec {
            address: Some("node-a".into()),
            tags: BTreeMap::new(),
        });
        let workers = build_workers(&config, &ExecutorConfig::default()).unwrap();

        assert!(workers[0].matches(&requirements("node==node-a")));
        assert!(!workers[0].matches(&requirements("node==node-b")));
        assert!(workers[0].to_string().contains("pool={1}"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PoolConfig::new(PoolType::Raw);
        assert!(build_workers(&config, &ExecutorConfig::default()).is_err());
    }
}
