/// Scripted in-memory provider for exercising the orchestration pipeline
/// without a live backend
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::error::Aggregate;
use super::events::{ClusterEvent, EventSink};
use crate::config::ResolvedConfig;
use crate::runtime::{node_name, NodeHandle, NodeRole, NodeState, Provider, RuntimeInfo};

/// Provider whose behavior is scripted per test
#[derive(Default)]
pub struct FakeProvider {
    pub info: RuntimeInfo,
    /// Backend state: cluster name -> node handles
    state: Mutex<HashMap<String, Vec<NodeHandle>>>,
    /// Create this many nodes, then fail provisioning (None = succeed)
    pub fail_provision_after: Option<usize>,
    /// Node names whose deletion fails
    pub failing_deletes: Vec<String>,
    /// Node names whose log collection fails
    pub failing_collects: Vec<String>,
    /// Fail every endpoint query
    pub fail_endpoint: bool,
    /// External endpoint reported for any cluster with a control plane
    pub endpoint: Option<String>,
    /// Last config passed to provision, for assertions
    last_provisioned: Mutex<Option<ResolvedConfig>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate backend state with running nodes
    pub fn seed(&self, cluster: &str, roles: &[NodeRole]) {
        let mut per_role: HashMap<NodeRole, usize> = HashMap::new();
        let nodes = roles
            .iter()
            .map(|&role| {
                let ordinal = per_role.entry(role).or_insert(0);
                let name = node_name(cluster, role, *ordinal);
                *ordinal += 1;
                NodeHandle {
                    id: format!("id-{}", name),
                    name,
                    role,
                    cluster: cluster.to_string(),
                    state: NodeState::Running,
                }
            })
            .collect();
        self.state.lock().unwrap().insert(cluster.to_string(), nodes);
    }

    pub fn node_count(&self, cluster: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .get(cluster)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn last_provisioned(&self) -> Option<ResolvedConfig> {
        self.last_provisioned.lock().unwrap().clone()
    }

    fn external_endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| "127.0.0.1:6443".to_string())
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn provision(&self, config: &ResolvedConfig) -> Result<()> {
        *self.last_provisioned.lock().unwrap() = Some(config.clone());

        let limit = self.fail_provision_after.unwrap_or(config.nodes.len());
        let mut per_role: HashMap<NodeRole, usize> = HashMap::new();
        let mut created = Vec::new();
        for node in config.nodes.iter().take(limit) {
            let ordinal = per_role.entry(node.role).or_insert(0);
            let name = node_name(&config.name, node.role, *ordinal);
            *ordinal += 1;
            created.push(NodeHandle {
                id: format!("id-{}", name),
                name,
                role: node.role,
                cluster: config.name.clone(),
                state: NodeState::Running,
            });
        }
        if !created.is_empty() {
            self.state
                .lock()
                .unwrap()
                .entry(config.name.clone())
                .or_default()
                .extend(created);
        }

        if self.fail_provision_after.is_some() {
            anyhow::bail!("failed to pull node image");
        }
        Ok(())
    }

    async fn list_clusters(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, nodes)| !nodes.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_nodes(&self, cluster: &str) -> Result<Vec<NodeHandle>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .get(cluster)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_nodes(&self, nodes: &[NodeHandle]) -> Result<(), Aggregate> {
        let mut agg = Aggregate::new();
        for node in nodes {
            if self.failing_deletes.contains(&node.name) {
                agg.push(node.name.clone(), anyhow::anyhow!("deletion refused"));
                continue;
            }
            let mut state = self.state.lock().unwrap();
            if let Some(members) = state.get_mut(&node.cluster) {
                members.retain(|n| n.name != node.name);
                if members.is_empty() {
                    state.remove(&node.cluster);
                }
            }
        }
        agg.into_result()
    }

    async fn api_server_endpoint(&self, cluster: &str) -> Result<String> {
        if self.fail_endpoint {
            anyhow::bail!("port mapping missing");
        }
        let has_control_plane = self
            .list_nodes(cluster)
            .await?
            .iter()
            .any(|n| n.role == NodeRole::ControlPlane && n.state == NodeState::Running);
        if !has_control_plane {
            anyhow::bail!("cluster {:?} has no running control-plane node", cluster);
        }
        Ok(self.external_endpoint())
    }

    async fn api_server_internal_endpoint(&self, cluster: &str) -> Result<String> {
        if self.fail_endpoint {
            anyhow::bail!("network lookup failed");
        }
        Ok(format!("{}:6443", node_name(cluster, NodeRole::ControlPlane, 0)))
    }

    async fn collect_logs(&self, dir: &Path, nodes: &[NodeHandle]) -> Result<(), Aggregate> {
        let mut agg = Aggregate::new();
        for node in nodes {
            if self.failing_collects.contains(&node.name) {
                agg.push(node.name.clone(), anyhow::anyhow!("log stream broken"));
                continue;
            }
            let node_dir = dir.join(&node.name);
            if let Err(e) = std::fs::create_dir_all(&node_dir)
                .and_then(|_| std::fs::write(node_dir.join("serial.log"), "fake logs\n"))
            {
                agg.push(node.name.clone(), e.into());
            }
        }
        agg.into_result()
    }

    fn info(&self) -> RuntimeInfo {
        self.info
    }
}

/// Sink that records emitted events for assertions
#[derive(Default)]
pub struct RecordingSink(pub Mutex<Vec<ClusterEvent>>);

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &ClusterEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}
