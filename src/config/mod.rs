/// Cluster topology configuration and creation-time resolution
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::runtime::NodeRole;

/// Default node image booted for each cluster member
pub const DEFAULT_NODE_IMAGE: &str = "ghcr.io/ferrite/node:v1.30.0";

/// Default cluster name when neither config nor caller supplies one
pub const DEFAULT_CLUSTER_NAME: &str = "ferrite";

/// Main cluster configuration as loaded from disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name (used as the container name prefix)
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Node image used for members that do not override it
    #[serde(default = "default_node_image")]
    pub node_image: String,

    /// Cluster members
    pub nodes: Vec<NodeConfig>,
}

/// One group of identically configured nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Role of every node in this group
    pub role: NodeRole,

    /// Number of nodes to create with this configuration
    #[serde(default = "default_one")]
    pub count: u32,

    /// Image override for this group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Additional host directories mounted into each node
    #[serde(default)]
    pub extra_mounts: Vec<MountSpec>,

    /// Additional container ports published on the host
    #[serde(default)]
    pub extra_port_mappings: Vec<PortMapping>,

    /// Resource limits, applied only when the backend can enforce them
    #[serde(default)]
    pub resources: ResourceLimits,
}

/// Host directory mounted into a node container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Container port published on the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    /// Host address the port binds to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

/// Per-node resource limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,

    /// Maximum number of processes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<u64>,

    /// Relative CPU weight
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_bytes.is_none() && self.pids.is_none() && self.cpu_shares.is_none()
    }
}

/// Caller-supplied overrides and policy for one creation attempt
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Cluster name override
    pub name: Option<String>,

    /// Node image override applied to every node
    pub image: Option<String>,

    /// Keep nodes for debugging when creation fails
    pub retain: bool,

    /// How long to wait for the control plane to answer (zero = no wait)
    pub wait: Duration,
}

/// Normalized configuration for one creation attempt
///
/// Counts are expanded, overrides merged, and the topology validated; this
/// is the only form providers ever see.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub name: String,
    /// One entry per node instance, control-plane entries first
    pub nodes: Vec<ResolvedNode>,
    pub retain: bool,
    pub wait: Duration,
}

/// One node instance of the resolved topology
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub role: NodeRole,
    pub image: String,
    pub extra_mounts: Vec<MountSpec>,
    pub extra_port_mappings: Vec<PortMapping>,
    pub resources: ResourceLimits,
}

fn default_cluster_name() -> String {
    DEFAULT_CLUSTER_NAME.to_string()
}

fn default_node_image() -> String {
    DEFAULT_NODE_IMAGE.to_string()
}

fn default_one() -> u32 {
    1
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

impl ClusterConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClusterConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge creation options into a validated, count-expanded topology
    pub fn resolve(&self, opts: &CreateOptions) -> anyhow::Result<ResolvedConfig> {
        let name = opts.name.clone().unwrap_or_else(|| self.name.clone());
        validate_cluster_name(&name)?;

        if self.nodes.is_empty() {
            anyhow::bail!("topology has no nodes");
        }

        let mut nodes = Vec::new();
        for group in &self.nodes {
            if group.count == 0 {
                anyhow::bail!("node group with role {} has count 0", group.role);
            }
            let image = opts
                .image
                .clone()
                .or_else(|| group.image.clone())
                .unwrap_or_else(|| self.node_image.clone());
            for _ in 0..group.count {
                nodes.push(ResolvedNode {
                    role: group.role,
                    image: image.clone(),
                    extra_mounts: group.extra_mounts.clone(),
                    extra_port_mappings: group.extra_port_mappings.clone(),
                    resources: group.resources.clone(),
                });
            }
        }

        let role_count =
            |role: NodeRole| nodes.iter().filter(|n| n.role == role).count();

        if role_count(NodeRole::ControlPlane) == 0 {
            anyhow::bail!("topology needs at least one control-plane node");
        }
        if role_count(NodeRole::ExternalLoadBalancer) > 1 {
            anyhow::bail!("topology allows at most one external load balancer");
        }
        if role_count(NodeRole::ExternalEtcd) > 1 {
            anyhow::bail!("topology allows at most one external etcd node");
        }

        // Load balancer and control planes first: providers start nodes in
        // this order so workers always find a reachable control plane.
        nodes.sort_by_key(|n| match n.role {
            NodeRole::ExternalLoadBalancer => 0,
            NodeRole::ExternalEtcd => 1,
            NodeRole::ControlPlane => 2,
            NodeRole::Worker => 3,
        });

        Ok(ResolvedConfig {
            name,
            nodes,
            retain: opts.retain,
            wait: opts.wait,
        })
    }

    /// Smallest viable topology: one control-plane node
    pub fn minimal() -> Self {
        Self {
            name: DEFAULT_CLUSTER_NAME.to_string(),
            node_image: DEFAULT_NODE_IMAGE.to_string(),
            nodes: vec![NodeConfig {
                role: NodeRole::ControlPlane,
                count: 1,
                image: None,
                extra_mounts: vec![],
                extra_port_mappings: vec![],
                resources: ResourceLimits::default(),
            }],
        }
    }

    /// Generate an example configuration file
    pub fn example() -> Self {
        Self {
            name: "dev".to_string(),
            node_image: DEFAULT_NODE_IMAGE.to_string(),
            nodes: vec![
                NodeConfig {
                    role: NodeRole::ControlPlane,
                    count: 1,
                    image: None,
                    extra_mounts: vec![],
                    extra_port_mappings: vec![],
                    resources: ResourceLimits::default(),
                },
                NodeConfig {
                    role: NodeRole::Worker,
                    count: 2,
                    image: None,
                    extra_mounts: vec![],
                    extra_port_mappings: vec![],
                    resources: ResourceLimits::default(),
                },
            ],
        }
    }
}

/// Check that a name works as a container name prefix
fn validate_cluster_name(name: &str) -> anyhow::Result<()> {
    match name.chars().next() {
        None => anyhow::bail!("cluster name cannot be empty"),
        Some(first) if !first.is_ascii_lowercase() && !first.is_ascii_digit() => {
            anyhow::bail!(
                "invalid cluster name {:?}: must start with a lowercase letter or digit",
                name
            );
        }
        Some(_) => {}
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        anyhow::bail!(
            "invalid cluster name {:?}: only lowercase letters, digits, '-' and '.' are allowed",
            name
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_expands_counts_and_orders_roles() {
        let config = ClusterConfig {
            name: "dev".to_string(),
            node_image: "img:1".to_string(),
            nodes: vec![
                NodeConfig {
                    role: NodeRole::Worker,
                    count: 2,
                    image: None,
                    extra_mounts: vec![],
                    extra_port_mappings: vec![],
                    resources: ResourceLimits::default(),
                },
                NodeConfig {
                    role: NodeRole::ControlPlane,
                    count: 1,
                    image: None,
                    extra_mounts: vec![],
                    extra_port_mappings: vec![],
                    resources: ResourceLimits::default(),
                },
            ],
        };

        let resolved = config.resolve(&CreateOptions::default()).unwrap();
        assert_eq!(resolved.name, "dev");
        assert_eq!(resolved.nodes.len(), 3);
        // Control plane sorts before the workers
        assert_eq!(resolved.nodes[0].role, NodeRole::ControlPlane);
        assert_eq!(resolved.nodes[1].role, NodeRole::Worker);
        assert_eq!(resolved.nodes[2].role, NodeRole::Worker);
    }

    #[test]
    fn test_resolve_rejects_missing_control_plane() {
        let config = ClusterConfig {
            name: "dev".to_string(),
            node_image: "img:1".to_string(),
            nodes: vec![NodeConfig {
                role: NodeRole::Worker,
                count: 3,
                image: None,
                extra_mounts: vec![],
                extra_port_mappings: vec![],
                resources: ResourceLimits::default(),
            }],
        };

        let err = config.resolve(&CreateOptions::default()).unwrap_err();
        assert!(err.to_string().contains("control-plane"));
    }

    #[test]
    fn test_resolve_rejects_empty_topology() {
        let config = ClusterConfig {
            name: "dev".to_string(),
            node_image: "img:1".to_string(),
            nodes: vec![],
        };

        assert!(config.resolve(&CreateOptions::default()).is_err());
    }

    #[test]
    fn test_resolve_applies_overrides() {
        let config = ClusterConfig::example();
        let opts = CreateOptions {
            name: Some("ci-42".to_string()),
            image: Some("img:override".to_string()),
            retain: true,
            wait: Duration::from_secs(30),
        };

        let resolved = config.resolve(&opts).unwrap();
        assert_eq!(resolved.name, "ci-42");
        assert!(resolved.retain);
        assert_eq!(resolved.wait, Duration::from_secs(30));
        assert!(resolved.nodes.iter().all(|n| n.image == "img:override"));
    }

    #[test]
    fn test_cluster_name_validation() {
        assert!(validate_cluster_name("dev").is_ok());
        assert!(validate_cluster_name("dev-2.local").is_ok());
        assert!(validate_cluster_name("").is_err());
        assert!(validate_cluster_name("-dev").is_err());
        assert!(validate_cluster_name("Dev").is_err());
        assert!(validate_cluster_name("dev cluster").is_err());
    }

    #[test]
    fn test_example_round_trips_through_yaml() {
        let yaml = serde_yaml::to_string(&ClusterConfig::example()).unwrap();
        let parsed: ClusterConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.name, "dev");
        assert_eq!(parsed.nodes.len(), 2);
        assert!(parsed.resolve(&CreateOptions::default()).is_ok());
    }
}
