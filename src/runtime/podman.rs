/// Podman backend adapter
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

const ENGINE: &str = "podman";

/// Provider implementation over the Podman engine
///
/// Podman exposes the same CLI surface as Docker for the operations this
/// provider needs, but reports its capabilities in a different JSON shape
/// and defaults to rootless operation on most installs.
pub struct PodmanProvider {
    info: RuntimeInfo,
}

/// The slice of `podman info` output the capability probe reads
#[derive(Debug, Default, Deserialize)]
struct PodmanInfo {
    #[serde(default)]
    host: PodmanHost,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodmanHost {
    #[serde(default)]
    security: PodmanSecurity,
    #[serde(default)]
    cgroup_version: String,
    #[serde(default)]
    cgroup_controllers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PodmanSecurity {
    #[serde(default)]
    rootless: bool,
}

impl From<PodmanInfo> for RuntimeInfo {
    fn from(raw: PodmanInfo) -> Self {
        let controller = |name: &str| {
            raw.host
                .cgroup_controllers
                .iter()
                .any(|c| c.as_str() == name)
        };
        RuntimeInfo {
            rootless: raw.host.security.rootless,
            cgroup2: raw.host.cgroup_version == "v2",
            // Rootless podman only enforces the limits whose cgroup
            // controllers are delegated to the user session.
            supports_memory_limit: controller("memory"),
            supports_pids_limit: controller("pids"),
            supports_cpu_shares: controller("cpu"),
        }
    }
}

impl PodmanProvider {
    /// Probe the engine once and capture its capability matrix
    pub async fn new() -> Result<Self> {
        let raw = EngineCommand::new(ENGINE)
            .args(["info", "--format", "json"])
            .context("podman is not answering")
            .run()
            .await?;
        let parsed: PodmanInfo =
            serde_json::from_str(raw.trim()).context("failed to parse podman info output")?;
        Ok(Self {
            info: parsed.into(),
        })
    }

    /// Create or reuse the shared node network
    async fn ensure_node_network(&self) -> Result<()> {
        if EngineCommand::new(ENGINE)
            .args(["network", "exists", NODE_NETWORK])
            .output()
            .await?
            .success
        {
            return Ok(());
        }

        debug!("Creating node network {}", NODE_NETWORK);
        let created = EngineCommand::new(ENGINE)
            .args(["network", "create", NODE_NETWORK])
            .output()
            .await?;
        if created.success {
            return Ok(());
        }

        // Lost the race against a concurrent creation
        if EngineCommand::new(ENGINE)
            .args(["network", "exists", NODE_NETWORK])
            .output()
            .await?
            .success
        {
            Ok(())
        } else {
            anyhow::bail!(
                "failed to create node network {}: {}",
                NODE_NETWORK,
                created.stderr.trim()
            )
        }
    }

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
            // SELinux relabeling breaks the node's own mounts under podman
            .args(["--security-opt", "label=disable"])
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
impl Provider for PodmanProvider {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn provision(&self, config: &ResolvedConfig) -> Result<()> {
        self.ensure_node_network().await?;

        let plans = plan_nodes(config);
        let (infra, workers): (Vec<_>, Vec<_>) = plans
            .into_iter()
            .partition(|(_, node)| node.role != NodeRole::Worker);

        // Same ordering rule as every backend: workers only start once the
        // control plane wave is up.
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
        Ok(format!("{}:{}", target.name, API_SERVER_PORT))
    }

    async fn collect_logs(&self, dir: &Path, nodes: &[NodeHandle]) -> Result<(), Aggregate> {
        let mut agg = Aggregate::new();

        match EngineCommand::new(ENGINE).arg("info").run().await {
            Ok(engine_info) => {
                if let Err(e) = tokio::fs::write(dir.join("podman-info.txt"), engine_info).await {
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
