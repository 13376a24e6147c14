/// Listing, deletion and log collection for existing clusters
use std::path::Path;
use tracing::info;

use super::error::ClusterError;
use crate::runtime::{NodeHandle, Provider};

/// Thin composition over the provider for lifecycle and diagnostics
///
/// Multi-target operations follow one rule throughout: every target is
/// attempted, per-node failures are merged into a single aggregate error,
/// and nothing fails fast.
pub struct ClusterManager<'p> {
    provider: &'p dyn Provider,
}

impl<'p> ClusterManager<'p> {
    pub fn new(provider: &'p dyn Provider) -> Self {
        Self { provider }
    }

    /// Names of all clusters known to the backend
    pub async fn list_clusters(&self) -> Result<Vec<String>, ClusterError> {
        self.provider
            .list_clusters()
            .await
            .map_err(|source| ClusterError::Backend { source })
    }

    /// Current nodes of a cluster, straight from the backend
    pub async fn cluster_nodes(&self, cluster: &str) -> Result<Vec<NodeHandle>, ClusterError> {
        self.provider
            .list_nodes(cluster)
            .await
            .map_err(|source| ClusterError::Backend { source })
    }

    /// Delete every node of a cluster
    ///
    /// A name with no nodes is a not-found error rather than a silent
    /// no-op, so callers can tell a typo from a deletion.
    pub async fn delete_cluster(&self, cluster: &str) -> Result<(), ClusterError> {
        let nodes = self.cluster_nodes(cluster).await?;
        if nodes.is_empty() {
            return Err(ClusterError::NotFound {
                cluster: cluster.to_string(),
            });
        }

        info!("Deleting {} nodes of cluster {}", nodes.len(), cluster);
        self.provider
            .delete_nodes(&nodes)
            .await
            .map_err(ClusterError::Partial)?;

        info!("Cluster {} deleted", cluster);
        Ok(())
    }

    /// Collect diagnostic artifacts from every node of a cluster into `dir`
    ///
    /// Output is namespaced per node (`<dir>/<node-name>/`), so collection
    /// never overwrites another node's artifacts.
    pub async fn collect_logs(&self, cluster: &str, dir: &Path) -> Result<(), ClusterError> {
        let nodes = self.cluster_nodes(cluster).await?;
        if nodes.is_empty() {
            return Err(ClusterError::NotFound {
                cluster: cluster.to_string(),
            });
        }

        std::fs::create_dir_all(dir).map_err(|e| ClusterError::Backend { source: e.into() })?;

        info!(
            "Collecting logs from {} nodes of cluster {} into {}",
            nodes.len(),
            cluster,
            dir.display()
        );
        self.provider
            .collect_logs(dir, &nodes)
            .await
            .map_err(ClusterError::Partial)
    }
}
