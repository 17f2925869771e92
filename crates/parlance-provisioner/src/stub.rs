use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parlance_domain::{
    Cluster, ClusterInstallation, DataResidence, Installation, InstallationBackup,
    InstallationDbRestoration, ProvisionerMetadata,
};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::provisioner::{
    BackupOperator, ClusterInstallationProvisioner, ClusterProvisioner, ClusterResourceStatus,
    DatabaseOperator, ImportBackend, ImportWork, JobStatus,
};

/// A stub engine that simulates provisioning in-process.
///
/// - Side effects log and succeed; readiness checks report ready after a
///   configurable number of polls.
/// - `set_fail_validation` / `set_fail_remote` / `set_fail_jobs` steer the
///   failure paths in supervisor tests.
/// - Performs no actual I/O.
#[derive(Debug, Default)]
pub struct StubProvisioner {
    checks_before_ready: u32,
    fail_validation: AtomicBool,
    fail_remote: AtomicBool,
    fail_jobs: AtomicBool,
    check_counts: Mutex<HashMap<String, u32>>,
}

impl StubProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Readiness checks report not-ready this many times before flipping.
    pub fn with_checks_before_ready(checks_before_ready: u32) -> Self {
        StubProvisioner { checks_before_ready, ..Self::default() }
    }

    /// Make preparatory/validating calls fail permanently.
    pub fn set_fail_validation(&self, fail: bool) {
        self.fail_validation.store(fail, Ordering::SeqCst);
    }

    /// Make side-effecting calls fail transiently.
    pub fn set_fail_remote(&self, fail: bool) {
        self.fail_remote.store(fail, Ordering::SeqCst);
    }

    /// Make remote jobs report failure instead of success.
    pub fn set_fail_jobs(&self, fail: bool) {
        self.fail_jobs.store(fail, Ordering::SeqCst);
    }

    async fn ready(&self, key: String) -> bool {
        let mut counts = self.check_counts.lock().await;
        let count = counts.entry(key).or_insert(0);
        *count += 1;
        *count > self.checks_before_ready
    }

    fn gate_validation(&self, what: &str) -> Result<(), ProvisionError> {
        if self.fail_validation.load(Ordering::SeqCst) {
            return Err(ProvisionError::Validation(format!("stub rejected {what}")));
        }
        Ok(())
    }

    fn gate_remote(&self, what: &str) -> Result<(), ProvisionError> {
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(ProvisionError::Remote(format!("stub remote failure during {what}")));
        }
        Ok(())
    }

    fn job_status(&self, ready: bool) -> JobStatus {
        if self.fail_jobs.load(Ordering::SeqCst) {
            JobStatus::Failed
        } else if ready {
            JobStatus::Succeeded
        } else {
            JobStatus::Running
        }
    }
}

#[async_trait]
impl ClusterProvisioner for StubProvisioner {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn prepare(&self, cluster: &Cluster) -> Result<ProvisionerMetadata, ProvisionError> {
        self.gate_validation("prepare")?;
        debug!(cluster_id = %cluster.id, "StubProvisioner: prepare");
        let mut metadata = cluster.provisioner_metadata.clone();
        if let ProvisionerMetadata::Kops(kops) = &mut metadata {
            if kops.name.is_empty() {
                kops.name = format!("{}-kops.k8s.local", cluster.id);
            }
        }
        Ok(metadata)
    }

    async fn create(&self, cluster: &Cluster) -> Result<(), ProvisionError> {
        self.gate_remote("create")?;
        debug!(cluster_id = %cluster.id, "StubProvisioner: create");
        Ok(())
    }

    async fn check_created(&self, cluster: &Cluster) -> Result<bool, ProvisionError> {
        self.gate_remote("check_created")?;
        Ok(self.ready(format!("cluster-created-{}", cluster.id)).await)
    }

    async fn create_nodes(&self, cluster: &Cluster) -> Result<(), ProvisionError> {
        self.gate_remote("create_nodes")?;
        debug!(cluster_id = %cluster.id, "StubProvisioner: create_nodes");
        Ok(())
    }

    async fn check_nodes_created(&self, cluster: &Cluster) -> Result<bool, ProvisionError> {
        self.gate_remote("check_nodes_created")?;
        Ok(self.ready(format!("cluster-nodes-{}", cluster.id)).await)
    }

    async fn provision(
        &self,
        cluster: &Cluster,
    ) -> Result<BTreeMap<String, String>, ProvisionError> {
        self.gate_remote("provision")?;
        debug!(cluster_id = %cluster.id, "StubProvisioner: provision utilities");
        Ok(cluster
            .utility_versions
            .iter()
            .map(|(name, versions)| (name.clone(), versions.desired.clone()))
            .collect())
    }

    async fn upgrade(&self, cluster: &Cluster) -> Result<(), ProvisionError> {
        self.gate_remote("upgrade")?;
        debug!(cluster_id = %cluster.id, "StubProvisioner: upgrade");
        Ok(())
    }

    async fn resize(&self, cluster: &Cluster) -> Result<(), ProvisionError> {
        self.gate_remote("resize")?;
        debug!(cluster_id = %cluster.id, "StubProvisioner: resize");
        Ok(())
    }

    async fn rotate_nodes(&self, cluster: &Cluster) -> Result<(), ProvisionError> {
        self.gate_remote("rotate_nodes")?;
        debug!(cluster_id = %cluster.id, "StubProvisioner: rotate_nodes");
        Ok(())
    }

    async fn delete(&self, cluster: &Cluster) -> Result<bool, ProvisionError> {
        self.gate_remote("delete")?;
        Ok(self.ready(format!("cluster-deleted-{}", cluster.id)).await)
    }

    async fn refresh_metadata(
        &self,
        cluster: &Cluster,
    ) -> Result<ProvisionerMetadata, ProvisionError> {
        self.gate_remote("refresh_metadata")?;
        Ok(cluster.provisioner_metadata.clone())
    }
}

#[async_trait]
impl ClusterInstallationProvisioner for StubProvisioner {
    async fn create(
        &self,
        cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<(), ProvisionError> {
        self.gate_remote("cluster_installation create")?;
        debug!(
            cluster_id = %cluster.id,
            installation_id = %installation.id,
            namespace = %cluster_installation.namespace,
            "StubProvisioner: create cluster installation"
        );
        Ok(())
    }

    async fn update(
        &self,
        _cluster: &Cluster,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<(), ProvisionError> {
        self.gate_remote("cluster_installation update")?;
        debug!(
            installation_id = %installation.id,
            cluster_installation_id = %cluster_installation.id,
            "StubProvisioner: update cluster installation"
        );
        Ok(())
    }

    async fn hibernate(
        &self,
        _cluster: &Cluster,
        installation: &Installation,
        _cluster_installation: &ClusterInstallation,
    ) -> Result<(), ProvisionError> {
        self.gate_remote("hibernate")?;
        debug!(installation_id = %installation.id, "StubProvisioner: hibernate");
        Ok(())
    }

    async fn refresh_secrets(
        &self,
        _cluster: &Cluster,
        installation: &Installation,
        _cluster_installation: &ClusterInstallation,
    ) -> Result<(), ProvisionError> {
        self.gate_remote("refresh_secrets")?;
        debug!(installation_id = %installation.id, "StubProvisioner: refresh_secrets");
        Ok(())
    }

    async fn cluster_resource(
        &self,
        _cluster: &Cluster,
        cluster_installation: &ClusterInstallation,
    ) -> Result<ClusterResourceStatus, ProvisionError> {
        self.gate_remote("cluster_resource")?;
        let ready = self.ready(format!("cr-{}", cluster_installation.id)).await;
        Ok(if ready {
            ClusterResourceStatus {
                spec_generation: 1,
                observed_generation: 1,
                state: "stable".to_string(),
            }
        } else {
            ClusterResourceStatus {
                spec_generation: 1,
                observed_generation: 0,
                state: "reconciling".to_string(),
            }
        })
    }

    async fn delete(
        &self,
        _cluster: &Cluster,
        cluster_installation: &ClusterInstallation,
    ) -> Result<bool, ProvisionError> {
        self.gate_remote("cluster_installation delete")?;
        Ok(self.ready(format!("ci-deleted-{}", cluster_installation.id)).await)
    }

    async fn verify_matches_config(
        &self,
        _cluster: &Cluster,
        _installation: &Installation,
        _cluster_installation: &ClusterInstallation,
    ) -> Result<bool, ProvisionError> {
        self.gate_remote("verify_matches_config")?;
        Ok(true)
    }

    async fn ensure_cr_migrated(
        &self,
        _cluster: &Cluster,
        _cluster_installation: &ClusterInstallation,
    ) -> Result<bool, ProvisionError> {
        self.gate_remote("ensure_cr_migrated")?;
        Ok(false)
    }
}

#[async_trait]
impl BackupOperator for StubProvisioner {
    async fn trigger_backup(
        &self,
        installation: &Installation,
        cluster_installation: &ClusterInstallation,
    ) -> Result<DataResidence, ProvisionError> {
        self.gate_remote("trigger_backup")?;
        debug!(
            installation_id = %installation.id,
            cluster_installation_id = %cluster_installation.id,
            "StubProvisioner: trigger_backup"
        );
        Ok(DataResidence {
            region: "us-east-1".to_string(),
            url: format!("s3://parlance-backups/{}", installation.id),
            object_key: format!("{}.tar.gz", Uuid::new_v4()),
        })
    }

    async fn check_backup_status(
        &self,
        backup: &InstallationBackup,
    ) -> Result<JobStatus, ProvisionError> {
        self.gate_remote("check_backup_status")?;
        let ready = self.ready(format!("backup-{}", backup.id)).await;
        Ok(self.job_status(ready))
    }
}

#[async_trait]
impl DatabaseOperator for StubProvisioner {
    async fn trigger_restoration(
        &self,
        installation: &Installation,
        backup: &InstallationBackup,
    ) -> Result<(), ProvisionError> {
        self.gate_remote("trigger_restoration")?;
        debug!(
            installation_id = %installation.id,
            backup_id = %backup.id,
            "StubProvisioner: trigger_restoration"
        );
        Ok(())
    }

    async fn check_restoration_status(
        &self,
        restoration: &InstallationDbRestoration,
    ) -> Result<JobStatus, ProvisionError> {
        self.gate_remote("check_restoration_status")?;
        let ready = self.ready(format!("restoration-{}", restoration.id)).await;
        Ok(self.job_status(ready))
    }

    async fn switch_database(
        &self,
        installation: &Installation,
        source_database: &str,
        destination_database: &str,
    ) -> Result<(), ProvisionError> {
        self.gate_remote("switch_database")?;
        debug!(
            installation_id = %installation.id,
            source = source_database,
            destination = destination_database,
            "StubProvisioner: switch_database"
        );
        Ok(())
    }

    async fn refinalize(&self, installation: &Installation) -> Result<(), ProvisionError> {
        self.gate_remote("refinalize")?;
        debug!(installation_id = %installation.id, "StubProvisioner: refinalize");
        Ok(())
    }
}

/// In-memory queue standing in for the external translation service.
#[derive(Debug, Default)]
pub struct StubImportBackend {
    queue: Mutex<VecDeque<ImportWork>>,
    completed: Mutex<Vec<(String, Option<String>)>>,
}

impl StubImportBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_work(&self, work: ImportWork) {
        self.queue.lock().await.push_back(work);
    }

    /// (work id, error) pairs reported via `complete`, in order.
    pub async fn completed(&self) -> Vec<(String, Option<String>)> {
        self.completed.lock().await.clone()
    }
}

#[async_trait]
impl ImportBackend for StubImportBackend {
    async fn next_ready_translation(&self) -> Result<Option<ImportWork>, ProvisionError> {
        Ok(self.queue.lock().await.pop_front())
    }

    async fn stage_archive(
        &self,
        work: &ImportWork,
        installation: &Installation,
    ) -> Result<String, ProvisionError> {
        debug!(
            work_id = %work.id,
            installation_id = %installation.id,
            "StubImportBackend: stage_archive"
        );
        Ok(format!("import/{}/{}.zip", installation.id, work.id))
    }

    async fn run_import(
        &self,
        work: &ImportWork,
        installation: &Installation,
        staged_key: &str,
    ) -> Result<(), ProvisionError> {
        debug!(
            work_id = %work.id,
            installation_id = %installation.id,
            staged_key,
            "StubImportBackend: run_import"
        );
        Ok(())
    }

    async fn complete(
        &self,
        work: &ImportWork,
        error: Option<String>,
    ) -> Result<(), ProvisionError> {
        self.completed.lock().await.push((work.id.clone(), error));
        Ok(())
    }
}
