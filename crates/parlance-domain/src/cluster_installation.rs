use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ClusterId, ClusterInstallationId, InstallationId, Lease};

/// The lifecycle state of one installation's deployment onto one cluster.
///
/// Reconciling completes only when the in-cluster custom resource reports
/// `observed_generation == spec_generation` and a stable status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterInstallationState {
    CreationRequested,
    Reconciling,
    CreationFailed,
    Stable,
    DeletionRequested,
    DeletionFailed,
    Deleted,
}

impl ClusterInstallationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterInstallationState::CreationRequested => "creation-requested",
            ClusterInstallationState::Reconciling => "reconciling",
            ClusterInstallationState::CreationFailed => "creation-failed",
            ClusterInstallationState::Stable => "stable",
            ClusterInstallationState::DeletionRequested => "deletion-requested",
            ClusterInstallationState::DeletionFailed => "deletion-failed",
            ClusterInstallationState::Deleted => "deleted",
        }
    }

    pub fn pending_work(&self) -> bool {
        !matches!(
            self,
            ClusterInstallationState::Stable | ClusterInstallationState::Deleted
        )
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, ClusterInstallationState::Deleted)
    }
}

impl std::fmt::Display for ClusterInstallationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The binding of one installation to one cluster. Unique on
/// `(cluster_id, installation_id)` while non-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInstallation {
    pub id: ClusterInstallationId,
    pub cluster_id: ClusterId,
    pub installation_id: InstallationId,
    /// Kubernetes namespace the installation lives in on this cluster.
    pub namespace: String,
    pub state: ClusterInstallationState,
    #[serde(default)]
    pub lease: Lease,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterInstallation {
    pub fn new(
        cluster_id: ClusterId,
        installation_id: InstallationId,
        now: DateTime<Utc>,
    ) -> Self {
        let id = ClusterInstallationId::generate();
        ClusterInstallation {
            namespace: installation_id.as_str().to_string(),
            id,
            cluster_id,
            installation_id,
            state: ClusterInstallationState::CreationRequested,
            lease: Lease::default(),
            created_at: now,
            updated_at: now,
        }
    }
}
