/// Structured error taxonomy for cluster lifecycle operations
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error type for cluster lifecycle operations
///
/// Every variant carries enough context (cluster name, failing node where
/// applicable) for the caller to decide retry or report without re-deriving
/// backend state.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Invalid or contradictory topology; detected before touching the
    /// backend, so nothing was created
    #[error("invalid cluster configuration: {reason}")]
    Config { reason: String },

    /// The requested name already has nodes in the backend
    #[error("a cluster named {cluster:?} already exists")]
    DuplicateCluster { cluster: String },

    /// No nodes exist under the given cluster name
    #[error("unknown cluster {cluster:?}")]
    NotFound { cluster: String },

    /// A backend query failed outside of a creation attempt
    #[error("container runtime backend error")]
    Backend {
        #[source]
        source: anyhow::Error,
    },

    /// The backend failed to create one or more required nodes
    #[error("failed to provision cluster {cluster:?}")]
    Provision {
        cluster: String,
        #[source]
        source: anyhow::Error,
        rollback: RollbackOutcome,
    },

    /// The control plane did not answer within the configured wait; the
    /// cluster itself was created and is retained
    #[error("cluster {cluster:?} was created but not ready after {waited:?}")]
    ReadinessTimeout { cluster: String, waited: Duration },

    /// Nodes exist but the API server endpoint could not be determined
    #[error("failed to resolve the API server endpoint of cluster {cluster:?}")]
    Endpoint {
        cluster: String,
        #[source]
        source: anyhow::Error,
        rollback: RollbackOutcome,
    },

    /// A multi-target operation completed with per-node failures
    #[error(transparent)]
    Partial(#[from] Aggregate),
}

/// What happened to already-created nodes after a failed creation attempt
///
/// Attached to the triggering error as supplementary information; rollback
/// failures never replace the original error.
#[derive(Debug, Default)]
pub enum RollbackOutcome {
    /// Failure occurred before any node existed
    #[default]
    NotAttempted,
    /// Retention was requested; nodes were left in place for inspection
    Retained,
    /// Every node created for the attempt was deleted
    Completed,
    /// Rollback itself failed for some nodes
    Failed(Aggregate),
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackOutcome::NotAttempted => write!(f, "rollback not needed"),
            RollbackOutcome::Retained => write!(f, "nodes retained for debugging"),
            RollbackOutcome::Completed => write!(f, "nodes rolled back"),
            RollbackOutcome::Failed(agg) => write!(f, "rollback incomplete: {}", agg),
        }
    }
}

/// One failed target of a multi-target operation
#[derive(Debug)]
pub struct NodeFailure {
    pub node: String,
    pub error: anyhow::Error,
}

/// Per-node failures of a best-effort multi-target operation
///
/// Multi-target operations never fail fast: every target is attempted and
/// each failure is recorded here, so no partial result silently disappears.
#[derive(Debug, Default)]
pub struct Aggregate {
    failures: Vec<NodeFailure>,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failed target
    pub fn push(&mut self, node: impl Into<String>, error: anyhow::Error) {
        self.failures.push(NodeFailure {
            node: node.into(),
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn failures(&self) -> &[NodeFailure] {
        &self.failures
    }

    /// Ok when nothing failed, otherwise the aggregate itself
    pub fn into_result(self) -> Result<(), Aggregate> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} node operation(s) failed:", self.len())?;
        for failure in self.failures() {
            write!(f, " [{}: {:#}]", failure.node, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for Aggregate {}
