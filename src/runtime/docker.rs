/// Docker backend adapter
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use super::{
    endpoint_node, parse_port_binding, parse_ps_line, plan_nodes, ps_format, NodeHandle, NodeRole,
    Provider, RuntimeInfo, API_SERVER_PORT, CLUSTER_LABEL, NODE_NETWORK, ROLE_LABEL,
};
use crate::cluster::error::Aggregate;
use crate::config::{ResolvedConfig, ResolvedNode};
use crate::utils::command::EngineCommand;

const ENGINE: &str = "docker";

/// Provider implementation over the Docker engine
pub struct DockerProvider {
    info: RuntimeInfo,
}

/// The slice of `docker info` output the capability probe reads
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerInfo {
    #[serde(default)]
    security_options: Vec<String>,
    #[serde(default)]
    cgroup_version: String,
    #[serde(default)]
    memory_limit: bool,
    #[serde(default)]
    pids_limit: bool,
    #[serde(rename = "CPUShares", default)]
    cpu_shares: bool,
}

impl From<DockerInfo> for RuntimeInfo {
    fn from(raw: DockerInfo) -> Self {
        RuntimeInfo {
            rootless: raw
                .security_options
                .iter()
                .any(|opt| opt.contains("rootless")),
            cgroup2: raw.cgroup_version == "2",
            supports_memory_limit: raw.memory_limit,
            supports_pids_limit: raw.pids_limit,
            supports_cpu_shares: raw.cpu_shares,
        }
    }
}

impl DockerProvider {
    /// Probe the engine once and capture its capability matrix
    pub async fn new() -> Result<Self> {
        let raw = EngineCommand::new(ENGINE)
            .args(["info", "--format", "{{json .}}"])
            .context("docker is not answering; is the daemon running?")
            .run()
            .await?;
        let parsed: DockerInfo =
            serde_json::from_str(raw.trim()).context("failed to parse docker info output")?;
        Ok(Self {
            info: parsed.into(),
        })
    }

    /// Create or reuse the shared node network
    async fn ensure_node_network(&self) -> Result<()> {
        let exists = EngineCommand::new(ENGINE)
            .args(["network", "inspect", NODE_NETWORK])
            .output()
            .await?
            .success;
        if exists {
            return Ok(());
        }

        debug!("Creating node network {}", NODE_NETWORK);
        let created = EngineCommand::new(ENGINE)
            .args(["network", "create", "--driver", "bridge", NODE_NETWORK])
            .output()
            .await?;
        if created.success {
            return Ok(());
        }

        // A concurrent creation may have won the race; the network existing
        // now is the only thing that matters.
        let exists_now = EngineCommand::new(ENGINE)
            .args(["network", "inspect", NODE_NETWORK])
            .output()
            .await?
            .success;
        if exists_now {
            Ok(())
        } else {
            anyhow::bail!(
                "failed to create node network {}: {}",
                NODE_NETWORK,
                created.stderr.trim()
            )
        }
    }

    /// Start one wave of nodes concurrently
    async fn create_wave(&self, config: &ResolvedConfig, wave: &[(String, &ResolvedNode)]) -> Result<()> {
        let tasks = wave
            .iter()
            .map(|(name, node)| self.create_node(config, name, node));
        for result in join_all(tasks).await {
            result?;
        }
        Ok(())
    }

    /// Run a single node container
    async fn create_node(
        &self,
        config: &ResolvedConfig,
        name: &str,
        node: &ResolvedNode,
    ) -> Result<()> {
        info!("Creating {} node: {} (image: {})", node.role, name, node.image);

        let mut cmd = EngineCommand::new(ENGINE)
            .args(["run", "--detach", "--tty", "--privileged"])
            .args(["--security-opt", "seccomp=unconfined"])
            .arg("--restart=on-failure:1")
            .args(["--tmpfs", "/tmp", "--tmpfs", "/run"])
            .args(["--volume", "/var"])
            .args(["--hostname", name, "--name", name])
            .args(["--network", NODE_NETWORK])
            .arg("--label")
            .arg(format!("{}={}", CLUSTER_LABEL, config.name))
            .arg("--label")
            .arg(format!("{}={}", ROLE_LABEL, node.role));

        // Control planes and the load balancer expose the API server on an
        // ephemeral loopback port; the binding is read back at endpoint time.
        if matches!(
            node.role,
            NodeRole::ControlPlane | NodeRole::ExternalLoadBalancer
        ) {
            cmd = cmd
                .arg("--publish")
                .arg(format!("127.0.0.1:0:{}", API_SERVER_PORT));
        }

        for mount in &node.extra_mounts {
            let ro = if mount.read_only { ":ro" } else { "" };
            cmd = cmd.arg("--volume").arg(format!(
                "{}:{}{}",
                mount.host_path, mount.container_path, ro
            ));
        }
        for port in &node.extra_port_mappings {
            cmd = cmd.arg("--publish").arg(format!(
                "{}:{}:{}",
                port.listen_address, port.host_port, port.container_port
            ));
        }

        if let Some(bytes) = node.resources.memory_bytes {
            cmd = cmd.arg("--memory").arg(bytes.to_string());
        }
        if let Some(pids) = node.resources.pids {
            cmd = cmd.arg("--pids-limit").arg(pids.to_string());
        }
        if let Some(shares) = node.resources.cpu_shares {
            cmd = cmd.arg("--cpu-shares").arg(shares.to_string());
        }

        let id = cmd
            .arg(&node.image)
            .context(format!("Failed to create node {}", name))
            .run()
            .await?;
        debug!("Node {} started (id {})", name, id.trim());
        Ok(())
    }

    /// Collect one node's diagnostic artifacts into its own directory
    async fn collect_node(&self, dir: &Path, node: &NodeHandle) -> Result<()> {
        let node_dir = dir.join(&node.name);
        tokio::fs::create_dir_all(&node_dir)
            .await
            .context(format!("Failed to create log directory for {}", node.name))?;

        let logs = EngineCommand::new(ENGINE)
            .arg("logs")
            .arg(&node.id)
            .context(format!("Failed to read logs of {}", node.name))
            .output()
            .await?;
        tokio::fs::write(
            node_dir.join("serial.log"),
            format!("{}{}", logs.stdout, logs.stderr),
        )
        .await?;

        let inspect = EngineCommand::new(ENGINE)
            .arg("inspect")
            .arg(&node.id)
            .context(format!("Failed to inspect {}", node.name))
            .run()
            .await?;
        tokio::fs::write(node_dir.join("inspect.json"), inspect).await?;
        Ok(())
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn provision(&self, config: &ResolvedConfig) -> Result<()> {
        self.ensure_node_network().await?;

        let plans = plan_nodes(config);
        // Workers join an already started control plane: the load balancer,
        // etcd and control-plane wave must land first.
        let (infra, workers): (Vec<_>, Vec<_>) = plans
            .into_iter()
            .partition(|(_, node)| node.role != NodeRole::Worker);

        self.create_wave(config, &infra).await?;
        self.create_wave(config, &workers).await?;
        Ok(())
    }

    async fn list_clusters(&self) -> Result<Vec<String>> {
        let lines = EngineCommand::new(ENGINE)
            .args(["ps", "--all"])
            .arg("--filter")
            .arg(format!("label={}", CLUSTER_LABEL))
            .arg("--format")
            .arg(format!("{{{{.Label \"{}\"}}}}", CLUSTER_LABEL))
            .context("Failed to list clusters")
            .run_lines()
            .await?;

        let names: BTreeSet<String> = lines.into_iter().collect();
        Ok(names.into_iter().collect())
    }

    async fn list_nodes(&self, cluster: &str) -> Result<Vec<NodeHandle>> {
        let lines = EngineCommand::new(ENGINE)
            .args(["ps", "--all"])
            .arg("--filter")
            .arg(format!("label={}={}", CLUSTER_LABEL, cluster))
            .arg("--format")
            .arg(ps_format())
            .context(format!("Failed to list nodes of cluster {}", cluster))
            .run_lines()
            .await?;

        Ok(lines
            .iter()
            .filter_map(|line| parse_ps_line(line, cluster))
            .collect())
    }

    async fn delete_nodes(&self, nodes: &[NodeHandle]) -> Result<(), Aggregate> {
        let tasks = nodes.iter().map(|node| async move {
            info!("Deleting node {} (id {})", node.name, node.id);
            let result = EngineCommand::new(ENGINE)
                .args(["rm", "--force", "--volumes"])
                .arg(&node.id)
                .run_silent()
                .await;
            (node.name.clone(), result)
        });

        let mut agg = Aggregate::new();
        for (name, result) in join_all(tasks).await {
            if let Err(e) = result {
                agg.push(name, e);
            }
        }
        agg.into_result()
    }

    async fn api_server_endpoint(&self, cluster: &str) -> Result<String> {
        let nodes = self.list_nodes(cluster).await?;
        let target = endpoint_node(&nodes).ok_or_else(|| {
            anyhow::anyhow!("cluster {:?} has no running control-plane node", cluster)
        })?;

        let output = EngineCommand::new(ENGINE)
            .arg("port")
            .arg(&target.name)
            .arg(format!("{}/tcp", API_SERVER_PORT))
            .context(format!("Failed to read port binding of {}", target.name))
            .run()
            .await?;
        parse_port_binding(&output).ok_or_else(|| {
            anyhow::anyhow!(
                "node {} does not publish port {}",
                target.name,
                API_SERVER_PORT
            )
        })
    }

    async fn api_server_internal_endpoint(&self, cluster: &str) -> Result<String> {
        let nodes = self.list_nodes(cluster).await?;
        let target = endpoint_node(&nodes).ok_or_else(|| {
            anyhow::anyhow!("cluster {:?} has no running control-plane node", cluster)
        })?;
        // Node containers resolve each other by name on the shared network
        Ok(format!("{}:{}", target.name, API_SERVER_PORT))
    }

    async fn collect_logs(&self, dir: &Path, nodes: &[NodeHandle]) -> Result<(), Aggregate> {
        let mut agg = Aggregate::new();

        // Engine-level diagnostics next to the per-node directories
        match EngineCommand::new(ENGINE).arg("info").run().await {
            Ok(engine_info) => {
                if let Err(e) = tokio::fs::write(dir.join("docker-info.txt"), engine_info).await {
                    agg.push(ENGINE, e.into());
                }
            }
            Err(e) => agg.push(ENGINE, e),
        }

        let tasks = nodes.iter().map(|node| async move {
            let result = self.collect_node(dir, node).await;
            (node.name.clone(), result)
        });
        for (name, result) in join_all(tasks).await {
            if let Err(e) = result {
                agg.push(name, e);
            }
        }
        agg.into_result()
    }

    fn info(&self) -> RuntimeInfo {
        self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_info_maps_to_capabilities() {
        let raw = r#"{
            "SecurityOptions": ["name=seccomp,profile=builtin", "name=rootless"],
            "CgroupVersion": "2",
            "MemoryLimit": true,
            "PidsLimit": true,
            "CPUShares": false,
            "ServerVersion": "27.0.1"
        }"#;
        let parsed: DockerInfo = serde_json::from_str(raw).unwrap();
        let info: RuntimeInfo = parsed.into();

        assert!(info.rootless);
        assert!(info.cgroup2);
        assert!(info.supports_memory_limit);
        assert!(info.supports_pids_limit);
        assert!(!info.supports_cpu_shares);
    }

    #[test]
    fn test_docker_info_defaults_when_fields_missing() {
        let parsed: DockerInfo = serde_json::from_str("{}").unwrap();
        let info: RuntimeInfo = parsed.into();

        assert!(!info.rootless);
        assert!(!info.cgroup2);
        assert!(!info.supports_memory_limit);
    }
}
