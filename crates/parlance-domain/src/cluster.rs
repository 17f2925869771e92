use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ClusterId, Lease, Warning};

// ── Lifecycle state machine ───────────────────────────────────────────────────

/// The lifecycle state of a managed Kubernetes cluster.
///
/// Transitions:
///   CreationRequested → Creating → Created → ProvisioningRequested
///     → ProvisioningInProgress → Stable
///   Stable → UpgradeRequested → Upgrading → Stable
///   Stable → ResizeRequested → Resizing → Stable
///   * → DeletionRequested → Deleting → Deleted
///
/// Failed states are re-scanned: the supervisor retries the failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterState {
    CreationRequested,
    Creating,
    Created,
    CreationFailed,
    ProvisioningRequested,
    ProvisioningInProgress,
    ProvisioningFailed,
    Stable,
    UpgradeRequested,
    Upgrading,
    UpgradeFailed,
    ResizeRequested,
    Resizing,
    ResizeFailed,
    DeletionRequested,
    Deleting,
    DeletionFailed,
    Deleted,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::CreationRequested => "creation-requested",
            ClusterState::Creating => "creating",
            ClusterState::Created => "created",
            ClusterState::CreationFailed => "creation-failed",
            ClusterState::ProvisioningRequested => "provisioning-requested",
            ClusterState::ProvisioningInProgress => "provisioning-in-progress",
            ClusterState::ProvisioningFailed => "provisioning-failed",
            ClusterState::Stable => "stable",
            ClusterState::UpgradeRequested => "upgrade-requested",
            ClusterState::Upgrading => "upgrading",
            ClusterState::UpgradeFailed => "upgrade-failed",
            ClusterState::ResizeRequested => "resize-requested",
            ClusterState::Resizing => "resizing",
            ClusterState::ResizeFailed => "resize-failed",
            ClusterState::DeletionRequested => "deletion-requested",
            ClusterState::Deleting => "deleting",
            ClusterState::DeletionFailed => "deletion-failed",
            ClusterState::Deleted => "deleted",
        }
    }

    /// Whether the cluster supervisor should pick this cluster up.
    /// Stable and Deleted are resting states; everything else is work.
    pub fn pending_work(&self) -> bool {
        !matches!(self, ClusterState::Stable | ClusterState::Deleted)
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Provisioner engines ───────────────────────────────────────────────────────

/// The engine that realizes a cluster on the cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerKind {
    Kops,
    Eks,
}

impl std::fmt::Display for ProvisionerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionerKind::Kops => write!(f, "kops"),
            ProvisionerKind::Eks => write!(f, "eks"),
        }
    }
}

/// Engine-specific cluster metadata, dispatched on [`ProvisionerKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProvisionerMetadata {
    Kops(KopsMetadata),
    Eks(EksMetadata),
}

impl ProvisionerMetadata {
    pub fn kind(&self) -> ProvisionerKind {
        match self {
            ProvisionerMetadata::Kops(_) => ProvisionerKind::Kops,
            ProvisionerMetadata::Eks(_) => ProvisionerKind::Eks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KopsMetadata {
    /// kops cluster name, e.g. `abc123-kops.k8s.local`.
    pub name: String,
    pub version: String,
    pub master_instance_type: String,
    pub node_instance_type: String,
    pub node_min_count: u32,
    pub node_max_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EksMetadata {
    pub cluster_name: String,
    pub version: String,
    pub node_role_arn: Option<String>,
    pub node_instance_type: String,
    pub node_min_count: u32,
    pub node_max_count: u32,
}

// ── Cluster utilities ─────────────────────────────────────────────────────────

/// Desired vs. actually deployed version of one cluster utility
/// (ingress controller, metrics stack, …).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtilityVersions {
    pub desired: String,
    pub actual: String,
}

impl UtilityVersions {
    pub fn converged(&self) -> bool {
        self.desired == self.actual
    }
}

// ── Cluster ───────────────────────────────────────────────────────────────────

/// A Kubernetes cluster managed on behalf of installations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub provisioner: ProvisionerKind,
    pub provisioner_metadata: ProvisionerMetadata,
    pub state: ClusterState,
    /// Whether the installation scheduler may place new installations here.
    pub allow_installations: bool,
    /// Utility name → desired/actual versions.
    pub utility_versions: BTreeMap<String, UtilityVersions>,
    #[serde(default)]
    pub lease: Lease,
    pub last_warning: Option<Warning>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(provisioner_metadata: ProvisionerMetadata, now: DateTime<Utc>) -> Self {
        Cluster {
            id: ClusterId::generate(),
            provisioner: provisioner_metadata.kind(),
            provisioner_metadata,
            state: ClusterState::CreationRequested,
            allow_installations: true,
            utility_versions: BTreeMap::new(),
            lease: Lease::default(),
            last_warning: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_warning(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.last_warning = Some(Warning::new(message, now));
    }

    /// Whether every utility has converged to its desired version.
    pub fn utilities_converged(&self) -> bool {
        self.utility_versions.values().all(UtilityVersions::converged)
    }
}
