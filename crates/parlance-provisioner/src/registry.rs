use std::collections::HashMap;
use std::sync::Arc;

use parlance_domain::{Cluster, ProvisionerKind};

use crate::error::ProvisionError;
use crate::provisioner::{ClusterInstallationProvisioner, ClusterProvisioner};

/// Dispatches provisioner calls to the engine implementation selected by
/// `cluster.provisioner`. Multiple engines share the same supervisor
/// contract; nothing downstream knows which engine is behind a cluster.
#[derive(Default)]
pub struct ProvisionerRegistry {
    clusters: HashMap<ProvisionerKind, Arc<dyn ClusterProvisioner>>,
    cluster_installations: HashMap<ProvisionerKind, Arc<dyn ClusterInstallationProvisioner>>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster engine. Returns `&mut self` for chaining.
    pub fn register_cluster(
        &mut self,
        kind: ProvisionerKind,
        provisioner: Arc<dyn ClusterProvisioner>,
    ) -> &mut Self {
        self.clusters.insert(kind, provisioner);
        self
    }

    pub fn register_cluster_installation(
        &mut self,
        kind: ProvisionerKind,
        provisioner: Arc<dyn ClusterInstallationProvisioner>,
    ) -> &mut Self {
        self.cluster_installations.insert(kind, provisioner);
        self
    }

    /// Resolve the cluster engine for the given cluster.
    pub fn for_cluster(
        &self,
        cluster: &Cluster,
    ) -> Result<Arc<dyn ClusterProvisioner>, ProvisionError> {
        self.clusters
            .get(&cluster.provisioner)
            .cloned()
            .ok_or(ProvisionError::NotConfigured(cluster.provisioner))
    }

    /// Resolve the cluster-installation surface for the given cluster.
    pub fn cluster_installation_for(
        &self,
        cluster: &Cluster,
    ) -> Result<Arc<dyn ClusterInstallationProvisioner>, ProvisionError> {
        self.cluster_installations
            .get(&cluster.provisioner)
            .cloned()
            .ok_or(ProvisionError::NotConfigured(cluster.provisioner))
    }

    /// All engine kinds with a registered cluster provisioner.
    pub fn active_kinds(&self) -> Vec<ProvisionerKind> {
        self.clusters.keys().copied().collect()
    }
}
