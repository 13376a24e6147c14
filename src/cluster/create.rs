/// Multi-stage cluster creation pipeline
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::{Aggregate, ClusterError, RollbackOutcome};
use super::events::{ClusterEvent, EventSink, TracingSink};
use crate::config::{ClusterConfig, CreateOptions, ResolvedConfig};
use crate::runtime::{NodeHandle, NodeRole, NodeState, Provider, RuntimeInfo};
use crate::utils::polling::{Poller, WaitOutcome};

/// Pipeline stage of a creation attempt
///
/// Each stage is driven by its own function so the pipeline can be
/// exercised stage by stage against a scripted provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStage {
    ConfigResolved,
    Provisioning,
    WaitingForReady,
    EndpointResolved,
    Complete,
}

impl std::fmt::Display for CreateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CreateStage::ConfigResolved => "configuration resolved",
            CreateStage::Provisioning => "provisioning nodes",
            CreateStage::WaitingForReady => "waiting for control plane readiness",
            CreateStage::EndpointResolved => "resolving API server endpoints",
            CreateStage::Complete => "cluster ready",
        };
        write!(f, "{}", s)
    }
}

/// Successful creation result
#[derive(Debug, Clone)]
pub struct CreatedCluster {
    pub name: String,
    pub nodes: Vec<NodeHandle>,
    /// Caller-reachable host:port of the API server
    pub api_server_endpoint: String,
    /// API server address as seen from inside the node network
    pub api_server_internal_endpoint: String,
}

/// Drives the creation pipeline against one provider
pub struct ClusterCreator<'p> {
    provider: &'p dyn Provider,
    events: &'p dyn EventSink,
}

const DEFAULT_SINK: &TracingSink = &TracingSink;

impl<'p> ClusterCreator<'p> {
    /// Create a new creator with the default tracing event sink
    pub fn new(provider: &'p dyn Provider) -> Self {
        Self {
            provider,
            events: DEFAULT_SINK,
        }
    }

    /// Create a new creator emitting events into the given sink
    pub fn with_events(provider: &'p dyn Provider, events: &'p dyn EventSink) -> Self {
        Self { provider, events }
    }

    /// Run the full creation pipeline
    pub async fn create(
        &self,
        config: &ClusterConfig,
        opts: &CreateOptions,
    ) -> Result<CreatedCluster, ClusterError> {
        let mut resolved = config.resolve(opts).map_err(|e| ClusterError::Config {
            reason: format!("{:#}", e),
        })?;
        let cluster = resolved.name.clone();
        self.stage_started(&cluster, CreateStage::ConfigResolved);

        // Duplicate-name check before anything is created: merging into an
        // existing cluster is a configuration error, not a provisioning one.
        let existing = self
            .provider
            .list_clusters()
            .await
            .map_err(|source| ClusterError::Backend { source })?;
        if existing.iter().any(|c| c == &cluster) {
            self.stage_failed(&cluster, CreateStage::ConfigResolved);
            return Err(ClusterError::DuplicateCluster { cluster });
        }

        let backend = self.provider.info();
        debug!(
            "[{}] backend capabilities: rootless={} cgroup2={}",
            cluster, backend.rootless, backend.cgroup2
        );
        gate_resources(&mut resolved, backend);

        self.stage_started(&cluster, CreateStage::Provisioning);
        if let Err(source) = self.provider.provision(&resolved).await {
            self.stage_failed(&cluster, CreateStage::Provisioning);
            let rollback = self.settle_failure(&resolved).await;
            return Err(ClusterError::Provision {
                cluster,
                source,
                rollback,
            });
        }

        // Handles are rediscovered from the backend rather than trusted
        // from provisioning: backend state is the source of truth.
        let mut nodes = match self.provider.list_nodes(&cluster).await {
            Ok(nodes) => nodes,
            Err(source) => {
                self.stage_failed(&cluster, CreateStage::Provisioning);
                let rollback = self.settle_failure(&resolved).await;
                return Err(ClusterError::Provision {
                    cluster,
                    source,
                    rollback,
                });
            }
        };
        info!("[{}] provisioned {} nodes", cluster, nodes.len());

        let mut api_server_endpoint = None;

        if resolved.wait > Duration::ZERO {
            self.stage_started(&cluster, CreateStage::WaitingForReady);
            let endpoint = match self.provider.api_server_endpoint(&cluster).await {
                Ok(ep) => ep,
                Err(source) => {
                    self.stage_failed(&cluster, CreateStage::WaitingForReady);
                    let rollback = self.settle_failure(&resolved).await;
                    return Err(ClusterError::Endpoint {
                        cluster,
                        source,
                        rollback,
                    });
                }
            };

            if wait_for_api_server(&cluster, &endpoint, resolved.wait).await
                == WaitOutcome::DeadlineElapsed
            {
                // Soft failure: infrastructure-level creation already
                // succeeded, so the cluster is kept either way.
                self.stage_failed(&cluster, CreateStage::WaitingForReady);
                return Err(ClusterError::ReadinessTimeout {
                    cluster,
                    waited: resolved.wait,
                });
            }
            // Readiness is a control-plane property; workers have no
            // signal of their own at this layer.
            for node in &mut nodes {
                if node.role == NodeRole::ControlPlane && node.state == NodeState::Running {
                    node.state = NodeState::Ready;
                }
            }
            api_server_endpoint = Some(endpoint);
        }

        self.stage_started(&cluster, CreateStage::EndpointResolved);
        let endpoints = async {
            let external = match api_server_endpoint {
                Some(ep) => ep,
                None => self.provider.api_server_endpoint(&cluster).await?,
            };
            let internal = self.provider.api_server_internal_endpoint(&cluster).await?;
            Ok::<_, anyhow::Error>((external, internal))
        }
        .await;
        let (api_server_endpoint, api_server_internal_endpoint) = match endpoints {
            Ok(pair) => pair,
            Err(source) => {
                self.stage_failed(&cluster, CreateStage::EndpointResolved);
                let rollback = self.settle_failure(&resolved).await;
                return Err(ClusterError::Endpoint {
                    cluster,
                    source,
                    rollback,
                });
            }
        };

        self.stage_started(&cluster, CreateStage::Complete);
        Ok(CreatedCluster {
            name: cluster,
            nodes,
            api_server_endpoint,
            api_server_internal_endpoint,
        })
    }

    /// Apply the rollback-or-retain policy after a failed attempt
    ///
    /// This is the single place the policy branch is taken; the outcome is
    /// attached to the triggering error and never replaces it.
    async fn settle_failure(&self, resolved: &ResolvedConfig) -> RollbackOutcome {
        if resolved.retain {
            warn!(
                "[{}] creation failed, retaining nodes for debugging",
                resolved.name
            );
            return RollbackOutcome::Retained;
        }

        self.events.emit(&ClusterEvent::RollbackStarted {
            cluster: resolved.name.clone(),
        });

        let nodes = match self.provider.list_nodes(&resolved.name).await {
            Ok(nodes) => nodes,
            Err(e) => {
                let mut agg = Aggregate::new();
                agg.push(resolved.name.clone(), e);
                return RollbackOutcome::Failed(agg);
            }
        };
        if nodes.is_empty() {
            return RollbackOutcome::Completed;
        }

        match self.provider.delete_nodes(&nodes).await {
            Ok(()) => RollbackOutcome::Completed,
            Err(agg) => RollbackOutcome::Failed(agg),
        }
    }

    fn stage_started(&self, cluster: &str, stage: CreateStage) {
        self.events.emit(&ClusterEvent::StageStarted {
            cluster: cluster.to_string(),
            stage,
        });
    }

    fn stage_failed(&self, cluster: &str, stage: CreateStage) {
        self.events.emit(&ClusterEvent::StageFailed {
            cluster: cluster.to_string(),
            stage,
        });
    }
}

/// Strip resource-limit options the backend cannot enforce
///
/// Provisioning with an unenforced limit would silently hand out more than
/// the topology asked for, so unsupported options are dropped with a
/// warning instead of being passed through.
fn gate_resources(config: &mut ResolvedConfig, info: RuntimeInfo) {
    let mut stripped = Vec::new();
    for node in &mut config.nodes {
        if node.resources.memory_bytes.is_some() && !info.supports_memory_limit {
            node.resources.memory_bytes = None;
            stripped.push("memory limit");
        }
        if node.resources.pids.is_some() && !info.supports_pids_limit {
            node.resources.pids = None;
            stripped.push("pids limit");
        }
        if node.resources.cpu_shares.is_some() && !info.supports_cpu_shares {
            node.resources.cpu_shares = None;
            stripped.push("cpu shares");
        }
    }
    stripped.sort_unstable();
    stripped.dedup();
    for option in stripped {
        warn!(
            "[{}] backend cannot enforce {}, dropping it from node configuration",
            config.name, option
        );
    }
}

/// Poll the API server over HTTPS until it answers or the wait elapses
///
/// Any HTTP response counts as up, including 401/403: an unauthenticated
/// probe is expected to be rejected once the server is serving.
async fn wait_for_api_server(cluster: &str, endpoint: &str, wait: Duration) -> WaitOutcome {
    let client = match reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("[{}] could not build readiness probe client: {}", cluster, e);
            return WaitOutcome::DeadlineElapsed;
        }
    };
    let url = format!("https://{}/version", endpoint);

    let interval = (wait / 20).clamp(Duration::from_millis(100), Duration::from_secs(2));
    let poller = Poller::new(
        wait,
        interval,
        format!("Waiting for the API server of {}", cluster),
    );
    poller
        .poll_ready(|| {
            let client = client.clone();
            let url = url.clone();
            async move {
                match client.get(&url).send().await {
                    Ok(resp) => matches!(resp.status().as_u16(), 200 | 401 | 403),
                    Err(_) => false,
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{FakeProvider, RecordingSink};
    use crate::config::{NodeConfig, ResourceLimits};
    use crate::runtime::NodeRole;

    fn topology(roles: &[(NodeRole, u32)]) -> ClusterConfig {
        ClusterConfig {
            name: "dev".to_string(),
            node_image: "img:test".to_string(),
            nodes: roles
                .iter()
                .map(|&(role, count)| NodeConfig {
                    role,
                    count,
                    image: None,
                    extra_mounts: vec![],
                    extra_port_mappings: vec![],
                    resources: ResourceLimits::default(),
                })
                .collect(),
        }
    }

    fn stages(sink: &RecordingSink) -> Vec<CreateStage> {
        sink.events()
            .iter()
            .filter_map(|e| match e {
                ClusterEvent::StageStarted { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_one_control_plane_two_workers() {
        let provider = FakeProvider::new();
        let sink = RecordingSink::new();
        let creator = ClusterCreator::with_events(&provider, &sink);

        let config = topology(&[(NodeRole::ControlPlane, 1), (NodeRole::Worker, 2)]);
        let result = creator
            .create(&config, &CreateOptions::default())
            .await
            .unwrap();

        assert_eq!(result.name, "dev");
        assert_eq!(result.nodes.len(), 3);
        assert!(!result.api_server_endpoint.is_empty());
        assert_eq!(result.api_server_internal_endpoint, "dev-control-plane:6443");
        assert_eq!(provider.list_clusters().await.unwrap(), vec!["dev"]);

        // wait was zero, so the readiness stage never ran
        assert_eq!(
            stages(&sink),
            vec![
                CreateStage::ConfigResolved,
                CreateStage::Provisioning,
                CreateStage::EndpointResolved,
                CreateStage::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_name_is_config_error_and_creates_nothing() {
        let provider = FakeProvider::new();
        provider.seed("dev", &[NodeRole::ControlPlane]);
        let creator = ClusterCreator::new(&provider);

        let config = topology(&[(NodeRole::ControlPlane, 1), (NodeRole::Worker, 2)]);
        let err = creator
            .create(&config, &CreateOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::DuplicateCluster { .. }));
        assert_eq!(provider.node_count("dev"), 1);
    }

    #[tokio::test]
    async fn test_provision_failure_rolls_back_without_retain() {
        let mut provider = FakeProvider::new();
        provider.fail_provision_after = Some(1);
        let sink = RecordingSink::new();
        let creator = ClusterCreator::with_events(&provider, &sink);

        let config = ClusterConfig {
            name: "x".to_string(),
            ..topology(&[(NodeRole::ControlPlane, 1), (NodeRole::Worker, 2)])
        };
        let err = creator
            .create(&config, &CreateOptions::default())
            .await
            .unwrap_err();

        match err {
            ClusterError::Provision { cluster, rollback, .. } => {
                assert_eq!(cluster, "x");
                assert!(matches!(rollback, RollbackOutcome::Completed));
            }
            other => panic!("expected provisioning error, got {:?}", other),
        }
        assert_eq!(provider.node_count("x"), 0);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, ClusterEvent::RollbackStarted { .. })));
    }

    #[tokio::test]
    async fn test_provision_failure_keeps_nodes_with_retain() {
        let mut provider = FakeProvider::new();
        provider.fail_provision_after = Some(2);
        let creator = ClusterCreator::new(&provider);

        let config = topology(&[(NodeRole::ControlPlane, 1), (NodeRole::Worker, 2)]);
        let opts = CreateOptions {
            retain: true,
            ..CreateOptions::default()
        };
        let err = creator.create(&config, &opts).await.unwrap_err();

        match err {
            ClusterError::Provision { rollback, .. } => {
                assert!(matches!(rollback, RollbackOutcome::Retained));
            }
            other => panic!("expected provisioning error, got {:?}", other),
        }
        assert_eq!(provider.node_count("dev"), 2);
    }

    #[tokio::test]
    async fn test_rollback_failure_never_masks_the_original_error() {
        let mut provider = FakeProvider::new();
        provider.fail_provision_after = Some(1);
        provider.failing_deletes = vec!["dev-control-plane".to_string()];
        let creator = ClusterCreator::new(&provider);

        let config = topology(&[(NodeRole::ControlPlane, 1), (NodeRole::Worker, 1)]);
        let err = creator
            .create(&config, &CreateOptions::default())
            .await
            .unwrap_err();

        match err {
            ClusterError::Provision { source, rollback, .. } => {
                assert!(source.to_string().contains("node image"));
                match rollback {
                    RollbackOutcome::Failed(agg) => {
                        assert_eq!(agg.len(), 1);
                        assert_eq!(agg.failures()[0].node, "dev-control-plane");
                    }
                    other => panic!("expected failed rollback, got {}", other),
                }
            }
            other => panic!("expected provisioning error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_endpoint_failure_applies_rollback_policy() {
        let mut provider = FakeProvider::new();
        provider.fail_endpoint = true;
        let creator = ClusterCreator::new(&provider);

        let config = topology(&[(NodeRole::ControlPlane, 1)]);
        let err = creator
            .create(&config, &CreateOptions::default())
            .await
            .unwrap_err();

        match err {
            ClusterError::Endpoint { rollback, .. } => {
                assert!(matches!(rollback, RollbackOutcome::Completed));
            }
            other => panic!("expected endpoint error, got {:?}", other),
        }
        assert_eq!(provider.node_count("dev"), 0);
    }

    #[tokio::test]
    async fn test_readiness_timeout_is_soft_and_retains_the_cluster() {
        let mut provider = FakeProvider::new();
        // Nothing listens here, so the probe never succeeds
        provider.endpoint = Some("127.0.0.1:1".to_string());
        let creator = ClusterCreator::new(&provider);

        let config = topology(&[(NodeRole::ControlPlane, 1), (NodeRole::Worker, 1)]);
        let opts = CreateOptions {
            wait: Duration::from_millis(300),
            ..CreateOptions::default()
        };
        let err = creator.create(&config, &opts).await.unwrap_err();

        assert!(matches!(err, ClusterError::ReadinessTimeout { .. }));
        // Soft failure: nodes were never deleted
        assert_eq!(provider.node_count("dev"), 2);
        assert_eq!(provider.list_clusters().await.unwrap(), vec!["dev"]);
    }

    #[tokio::test]
    async fn test_topology_without_control_plane_is_config_error() {
        let provider = FakeProvider::new();
        let creator = ClusterCreator::new(&provider);

        let config = topology(&[(NodeRole::Worker, 2)]);
        let err = creator
            .create(&config, &CreateOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::Config { .. }));
        assert_eq!(provider.node_count("dev"), 0);
    }

    #[tokio::test]
    async fn test_unsupported_resource_limits_are_stripped() {
        let provider = FakeProvider::new(); // RuntimeInfo::default(): supports nothing
        let creator = ClusterCreator::new(&provider);

        let mut config = topology(&[(NodeRole::ControlPlane, 1)]);
        config.nodes[0].resources = ResourceLimits {
            memory_bytes: Some(2 * 1024 * 1024 * 1024),
            pids: Some(4096),
            cpu_shares: Some(512),
        };

        creator
            .create(&config, &CreateOptions::default())
            .await
            .unwrap();

        let seen = provider.last_provisioned().unwrap();
        assert!(seen.nodes[0].resources.is_empty());
    }

    #[test]
    fn test_gate_resources_keeps_supported_options() {
        let config = topology(&[(NodeRole::ControlPlane, 1)]);
        let mut resolved = config
            .resolve(&CreateOptions::default())
            .expect("valid topology");
        resolved.nodes[0].resources = ResourceLimits {
            memory_bytes: Some(1024),
            pids: Some(100),
            cpu_shares: Some(2),
        };

        let info = RuntimeInfo {
            supports_memory_limit: true,
            supports_pids_limit: false,
            supports_cpu_shares: true,
            ..RuntimeInfo::default()
        };
        gate_resources(&mut resolved, info);

        assert_eq!(resolved.nodes[0].resources.memory_bytes, Some(1024));
        assert_eq!(resolved.nodes[0].resources.pids, None);
        assert_eq!(resolved.nodes[0].resources.cpu_shares, Some(2));
    }
}
