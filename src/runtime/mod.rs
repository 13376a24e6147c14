/// Container runtime backends and the provider contract
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::cluster::error::Aggregate;
use crate::config::ResolvedConfig;
use crate::utils::command::is_engine_available;

pub mod docker;
pub mod podman;

pub use docker::DockerProvider;
pub use podman::PodmanProvider;

/// Label carrying the owning cluster name on every node container
pub const CLUSTER_LABEL: &str = "io.ferrite.cluster";
/// Label carrying the node role on every node container
pub const ROLE_LABEL: &str = "io.ferrite.role";

/// Environment variable forcing a specific backend ("docker" or "podman")
pub const PROVIDER_ENV: &str = "FERRITE_PROVIDER";

/// Node role in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
    ExternalLoadBalancer,
    ExternalEtcd,
}

impl NodeRole {
    /// Parse the label form written by provisioning
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "control-plane" => Some(NodeRole::ControlPlane),
            "worker" => Some(NodeRole::Worker),
            "external-load-balancer" => Some(NodeRole::ExternalLoadBalancer),
            "external-etcd" => Some(NodeRole::ExternalEtcd),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::ControlPlane => write!(f, "control-plane"),
            NodeRole::Worker => write!(f, "worker"),
            NodeRole::ExternalLoadBalancer => write!(f, "external-load-balancer"),
            NodeRole::ExternalEtcd => write!(f, "external-etcd"),
        }
    }
}

/// Observed lifecycle state of a node container
///
/// `Ready` only ever applies to control-plane nodes; workers have no
/// readiness signal at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    #[allow(dead_code)]
    Requested,
    Creating,
    Running,
    Ready,
    Failed,
    Deleted,
}

impl NodeState {
    /// Map a backend container status string to a node state
    pub fn from_container_status(status: &str) -> Self {
        match status {
            "running" => NodeState::Running,
            "created" | "restarting" | "paused" => NodeState::Creating,
            "exited" | "dead" | "stopped" => NodeState::Failed,
            "removing" => NodeState::Deleted,
            _ => NodeState::Failed,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Requested => "requested",
            NodeState::Creating => "creating",
            NodeState::Running => "running",
            NodeState::Ready => "ready",
            NodeState::Failed => "failed",
            NodeState::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

/// One provisioned node container
///
/// Handles are rediscovered from backend state on every listing; nothing
/// holds a long-lived copy, because the backend is the source of truth.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    /// Backend-assigned container id
    pub id: String,
    /// Container name (also the node's hostname on the cluster network)
    pub name: String,
    pub role: NodeRole,
    /// Owning cluster
    pub cluster: String,
    pub state: NodeState,
}

/// Static capability matrix of a backend runtime
///
/// Computed once per provider instance and never mutated afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeInfo {
    pub rootless: bool,
    pub cgroup2: bool,
    pub supports_memory_limit: bool,
    pub supports_pids_limit: bool,
    pub supports_cpu_shares: bool,
}

/// Backend-specific adapter for node provisioning, listing, deletion and
/// log collection over one container runtime
///
/// Providers are stateless: every operation is expressed over a cluster
/// name or an explicit list of node handles, and the backend's own
/// labeling is the only registry. Two processes driving the same backend
/// need no coordination beyond the backend's name uniqueness.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Engine name for logs and error messages
    fn name(&self) -> &'static str;

    /// Create every node the resolved topology asks for
    ///
    /// The external load balancer and control-plane nodes are started
    /// before workers. On error, containers already created are left in
    /// place for the caller's rollback/retain decision.
    async fn provision(&self, config: &ResolvedConfig) -> Result<()>;

    /// Distinct clusters currently known to the backend
    async fn list_clusters(&self) -> Result<Vec<String>>;

    /// Live node handles of a cluster, straight from the backend
    async fn list_nodes(&self, cluster: &str) -> Result<Vec<NodeHandle>>;

    /// Delete the given nodes, attempting every one of them
    async fn delete_nodes(&self, nodes: &[NodeHandle]) -> Result<(), Aggregate>;

    /// Caller-reachable host:port of the cluster's API server
    async fn api_server_endpoint(&self, cluster: &str) -> Result<String>;

    /// API server address reachable from within the cluster's node network
    async fn api_server_internal_endpoint(&self, cluster: &str) -> Result<String>;

    /// Pull diagnostic artifacts from each node into `dir`, one
    /// subdirectory per node
    async fn collect_logs(&self, dir: &Path, nodes: &[NodeHandle]) -> Result<(), Aggregate>;

    /// The backend's capability matrix
    fn info(&self) -> RuntimeInfo;
}

/// Container name for the node with the given per-role ordinal
///
/// The first node of a role gets the bare role suffix, replicas get a
/// numeric suffix starting at 2: `dev-worker`, `dev-worker2`.
pub fn node_name(cluster: &str, role: NodeRole, ordinal: usize) -> String {
    if ordinal == 0 {
        format!("{}-{}", cluster, role)
    } else {
        format!("{}-{}{}", cluster, role, ordinal + 1)
    }
}

/// Port the API server listens on inside control-plane nodes
pub(crate) const API_SERVER_PORT: u16 = 6443;

/// Shared bridge network every node container joins
///
/// One network for all clusters, never torn down, so deleting a cluster's
/// nodes leaves no orphan backend state behind.
pub(crate) const NODE_NETWORK: &str = "ferrite";

/// Assign container names to the resolved topology, in provisioning order
pub(crate) fn plan_nodes(
    config: &ResolvedConfig,
) -> Vec<(String, &crate::config::ResolvedNode)> {
    let mut per_role: std::collections::HashMap<NodeRole, usize> = std::collections::HashMap::new();
    config
        .nodes
        .iter()
        .map(|node| {
            let ordinal = per_role.entry(node.role).or_insert(0);
            let name = node_name(&config.name, node.role, *ordinal);
            *ordinal += 1;
            (name, node)
        })
        .collect()
}

/// Format string for `ps` listings shared by both engines
pub(crate) fn ps_format() -> String {
    format!(
        "{{{{.ID}}}}\t{{{{.Names}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.State}}}}",
        ROLE_LABEL
    )
}

/// Parse one line of `ps` output in [`ps_format`] into a node handle
pub(crate) fn parse_ps_line(line: &str, cluster: &str) -> Option<NodeHandle> {
    let mut parts = line.splitn(4, '\t');
    let id = parts.next()?.trim();
    let name = parts.next()?.trim();
    let role = NodeRole::from_label(parts.next()?.trim())?;
    let state = NodeState::from_container_status(&parts.next()?.trim().to_lowercase());
    if id.is_empty() || name.is_empty() {
        return None;
    }
    Some(NodeHandle {
        id: id.to_string(),
        name: name.to_string(),
        role,
        cluster: cluster.to_string(),
        state,
    })
}

/// Node whose address represents the cluster's API server
///
/// The external load balancer fronts the control planes when present,
/// otherwise the first running control-plane node is the endpoint.
pub(crate) fn endpoint_node(nodes: &[NodeHandle]) -> Option<&NodeHandle> {
    nodes
        .iter()
        .find(|n| n.role == NodeRole::ExternalLoadBalancer && n.state == NodeState::Running)
        .or_else(|| {
            nodes
                .iter()
                .find(|n| n.role == NodeRole::ControlPlane && n.state == NodeState::Running)
        })
}

/// First IPv4 host binding out of `port` output
pub(crate) fn parse_port_binding(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('['))
        .map(|l| l.to_string())
}

/// Pick the container runtime backend for this process
///
/// Honors `FERRITE_PROVIDER` when set, otherwise probes for docker first
/// and podman second.
pub async fn detect() -> Result<Box<dyn Provider>> {
    if let Ok(choice) = std::env::var(PROVIDER_ENV) {
        return match choice.as_str() {
            "docker" => Ok(Box::new(DockerProvider::new().await?)),
            "podman" => Ok(Box::new(PodmanProvider::new().await?)),
            other => anyhow::bail!(
                "unsupported value {:?} for {} (expected \"docker\" or \"podman\")",
                other,
                PROVIDER_ENV
            ),
        };
    }

    if is_engine_available("docker").await {
        return Ok(Box::new(DockerProvider::new().await?));
    }
    if is_engine_available("podman").await {
        return Ok(Box::new(PodmanProvider::new().await?));
    }

    anyhow::bail!("no supported container engine found (looked for docker, podman)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_role_display() {
        assert_eq!(NodeRole::ControlPlane.to_string(), "control-plane");
        assert_eq!(NodeRole::Worker.to_string(), "worker");
        assert_eq!(
            NodeRole::ExternalLoadBalancer.to_string(),
            "external-load-balancer"
        );
        assert_eq!(NodeRole::ExternalEtcd.to_string(), "external-etcd");
    }

    #[test]
    fn test_node_role_label_round_trip() {
        for role in [
            NodeRole::ControlPlane,
            NodeRole::Worker,
            NodeRole::ExternalLoadBalancer,
            NodeRole::ExternalEtcd,
        ] {
            assert_eq!(NodeRole::from_label(&role.to_string()), Some(role));
        }
        assert_eq!(NodeRole::from_label("gateway"), None);
    }

    #[test]
    fn test_node_state_from_container_status() {
        assert_eq!(
            NodeState::from_container_status("running"),
            NodeState::Running
        );
        assert_eq!(
            NodeState::from_container_status("created"),
            NodeState::Creating
        );
        assert_eq!(
            NodeState::from_container_status("exited"),
            NodeState::Failed
        );
    }

    #[test]
    fn test_node_name_ordinals() {
        assert_eq!(
            node_name("dev", NodeRole::ControlPlane, 0),
            "dev-control-plane"
        );
        assert_eq!(node_name("dev", NodeRole::Worker, 0), "dev-worker");
        assert_eq!(node_name("dev", NodeRole::Worker, 1), "dev-worker2");
        assert_eq!(node_name("dev", NodeRole::Worker, 2), "dev-worker3");
    }

    #[test]
    fn test_plan_nodes_names_replicas() {
        let config = crate::config::ClusterConfig {
            name: "dev".to_string(),
            node_image: "img:test".to_string(),
            nodes: vec![
                crate::config::NodeConfig {
                    role: NodeRole::ControlPlane,
                    count: 1,
                    image: None,
                    extra_mounts: vec![],
                    extra_port_mappings: vec![],
                    resources: Default::default(),
                },
                crate::config::NodeConfig {
                    role: NodeRole::Worker,
                    count: 2,
                    image: None,
                    extra_mounts: vec![],
                    extra_port_mappings: vec![],
                    resources: Default::default(),
                },
            ],
        };
        let resolved = config.resolve(&Default::default()).unwrap();

        let names: Vec<String> = plan_nodes(&resolved).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["dev-control-plane", "dev-worker", "dev-worker2"]);
    }

    #[test]
    fn test_parse_ps_line() {
        let line = "a1b2c3\tdev-worker2\tworker\trunning";
        let node = parse_ps_line(line, "dev").unwrap();
        assert_eq!(node.id, "a1b2c3");
        assert_eq!(node.name, "dev-worker2");
        assert_eq!(node.role, NodeRole::Worker);
        assert_eq!(node.state, NodeState::Running);
        assert_eq!(node.cluster, "dev");

        assert!(parse_ps_line("bad line", "dev").is_none());
        assert!(parse_ps_line("id\tname\tnot-a-role\trunning", "dev").is_none());
    }

    #[test]
    fn test_endpoint_node_prefers_load_balancer() {
        let handle = |name: &str, role, state| NodeHandle {
            id: format!("id-{}", name),
            name: name.to_string(),
            role,
            cluster: "dev".to_string(),
            state,
        };

        let nodes = vec![
            handle("dev-control-plane", NodeRole::ControlPlane, NodeState::Running),
            handle(
                "dev-external-load-balancer",
                NodeRole::ExternalLoadBalancer,
                NodeState::Running,
            ),
        ];
        assert_eq!(
            endpoint_node(&nodes).unwrap().name,
            "dev-external-load-balancer"
        );

        let nodes = vec![
            handle("dev-worker", NodeRole::Worker, NodeState::Running),
            handle("dev-control-plane", NodeRole::ControlPlane, NodeState::Failed),
        ];
        assert!(endpoint_node(&nodes).is_none());
    }

    #[test]
    fn test_parse_port_binding_skips_ipv6() {
        assert_eq!(
            parse_port_binding("[::]:32768\n127.0.0.1:43127\n"),
            Some("127.0.0.1:43127".to_string())
        );
        assert_eq!(parse_port_binding("\n"), None);
    }
}
