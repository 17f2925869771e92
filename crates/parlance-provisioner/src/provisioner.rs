use async_trait::async_trait;
use parlance_domain::{
    Cluster, ClusterInstallation, DataResidence, Installation, InstallationBackup,
    InstallationDbRestoration, InstallationId, ProvisionerMetadata,
};

use crate::error::ProvisionError;

/// Status of a long-running remote job (backup, restoration, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

/// Snapshot of the in-cluster custom resource backing a cluster installation.
/// Never modifies cluster state.
#[derive(Debug, Clone)]
pub struct ClusterResourceStatus {
    /// Generation of the spec as last written by the control plane.
    pub spec_generation: i64,
    /// Generation the in-cluster operator has acted upon.
    pub observed_generation: i64,
    /// State string reported by the operator, `stable` when settled.
    pub state: String,
}

impl ClusterResourceStatus {
    /// The operator has caught up with the spec and reports it settled.
    pub fn reconciled(&self) -> bool {
        self.observed_generation == self.spec_generation && self.state == "stable"
    }
}

/// Cluster-engine capability surface the cluster supervisor drives.
///
/// Every method may be slow and must be idempotent: re-invoking after a crash
/// either completes the prior attempt or is a no-op.
#[async_trait]
pub trait ClusterProvisioner: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Validate and complete the engine metadata before the first create.
    /// Returns the metadata to stamp onto the cluster record.
    async fn prepare(&self, cluster: &Cluster) -> Result<ProvisionerMetadata, ProvisionError>;

    /// Dispatch cluster creation with the cloud provider.
    async fn create(&self, cluster: &Cluster) -> Result<(), ProvisionError>;

    /// Whether the control plane of a previously dispatched create is up.
    async fn check_created(&self, cluster: &Cluster) -> Result<bool, ProvisionError>;

    /// Dispatch worker node group creation.
    async fn create_nodes(&self, cluster: &Cluster) -> Result<(), ProvisionError>;

    async fn check_nodes_created(&self, cluster: &Cluster) -> Result<bool, ProvisionError>;

    /// Deploy the cluster utilities. Returns utility name → deployed version.
    async fn provision(
        &self,
        cluster: &Cluster,
    ) -> Result<std::collections::BTreeMap<String, String>, ProvisionError>;

    async fn upgrade(&self, cluster: &Cluster) -> Result<(), ProvisionError>;

    async fn resize(&self, cluster: &Cluster) -> Result<(), ProvisionError>;

    /// Roll the worker nodes onto the current launch configuration.
    async fn rotate_nodes(&self, cluster: &Cluster) -> Result<(), ProvisionError>;

    /// Dispatch deletion and report whether the cluster is fully gone.
    /// Safe to call repeatedly; later calls observe rather than re-delete.
    async fn delete(&self, cluster: &Cluster) -> Result<bool, ProvisionError>;

    /// Re-read engine metadata from the cloud provider.
    async fn refresh_metadata(
        &self,
        cluster: &Cluster,
    ) -> Result<ProvisionerMetadata, ProvisionError>;
}

/// Per-cluster-installation capability surface.
#[async_trait]
pub trait ClusterInstallationProvisioner: Send + Sync + 'static {
    /// Create the namespace and custom resource for the installation.
    async fn create(
        &self,
        cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<(), ProvisionError>;

    /// Push the installation's current declarative spec to the custom
    /// resource.
    async fn update(
        &self,
        cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<(), ProvisionError>;

    /// Scale the installation's workloads to zero, keeping data.
    async fn hibernate(
        &self,
        cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<(), ProvisionError>;

    /// Re-sync database and filestore credentials into the namespace.
    async fn refresh_secrets(
        &self,
        cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<(), ProvisionError>;

    /// Observe the custom resource; the supervisor judges readiness.
    async fn cluster_resource(
        &self,
        cluster: &Cluster,
        cluster_installation: &ClusterInstallation,
    ) -> Result<ClusterResourceStatus, ProvisionError>;

    /// Delete the custom resource and namespace. Returns whether everything
    /// is confirmed gone.
    async fn delete(
        &self,
        cluster: &Cluster,
        cluster_installation: &ClusterInstallation,
    ) -> Result<bool, ProvisionError>;

    /// Whether the in-cluster resource matches the installation's spec.
    async fn verify_matches_config(
        &self,
        cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<bool, ProvisionError>;

    /// Migrate the custom resource to the current API version if needed.
    /// Returns whether a migration was performed.
    async fn ensure_cr_migrated(
        &self,
        cluster: &Cluster,
        cluster_installation: &ClusterInstallation,
    ) -> Result<bool, ProvisionError>;
}

/// Backup job surface the backup supervisor drives.
#[async_trait]
pub trait BackupOperator: Send + Sync + 'static {
    /// Start a backup job on the given cluster installation. Returns where
    /// the data will land.
    async fn trigger_backup(
        &self,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<DataResidence, ProvisionError>;

    async fn check_backup_status(
        &self,
        backup: &InstallationBackup,
    ) -> Result<JobStatus, ProvisionError>;
}

/// Database-level operations for restorations and migrations.
#[async_trait]
pub trait DatabaseOperator: Send + Sync + 'static {
    /// Start restoring `backup` into the installation's database.
    async fn trigger_restoration(
        &self,
        installation: &Installation,
        backup: &InstallationBackup,
    ) -> Result<(), ProvisionError>;

    async fn check_restoration_status(
        &self,
        restoration: &InstallationDbRestoration,
    ) -> Result<JobStatus, ProvisionError>;

    /// Point the installation at the destination database cluster.
    async fn switch_database(
        &self,
        installation: &Installation,
        source_database: &str,
        destination_database: &str,
    ) -> Result<(), ProvisionError>;

    /// Re-finalize the installation against its new database (credentials,
    /// connection strings, cluster installation secrets).
    async fn refinalize(&self, installation: &Installation) -> Result<(), ProvisionError>;
}

/// One unit of work handed out by the external translation service.
#[derive(Debug, Clone)]
pub struct ImportWork {
    pub id: String,
    pub installation_id: InstallationId,
    /// Location of the translated archive in the translation service's
    /// bucket.
    pub archive_url: String,
}

/// Archive-import surface driven by the import supervisor: fetch translated
/// workspace archives, stage them next to the installation, run the CLI
/// import.
#[async_trait]
pub trait ImportBackend: Send + Sync + 'static {
    /// Next translation whose archive is ready for import, if any.
    async fn next_ready_translation(&self) -> Result<Option<ImportWork>, ProvisionError>;

    /// Copy the archive from the translation bucket into the installation's
    /// multitenant bucket. Returns the staged object key.
    async fn stage_archive(
        &self,
        work: &ImportWork,
        installation: &Installation,
    ) -> Result<String, ProvisionError>;

    /// Execute the import command against the installation.
    async fn run_import(
        &self,
        work: &ImportWork,
        installation: &Installation,
        staged_key: &str,
    ) -> Result<(), ProvisionError>;

    /// Report the work item finished, successfully or not.
    async fn complete(
        &self,
        work: &ImportWork,
        error: Option<String>,
    ) -> Result<(), ProvisionError>;
}
