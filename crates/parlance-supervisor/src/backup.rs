use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parlance_domain::{
    BackupState, ClusterInstallationState, InstallationBackup, ResourceType,
};
use parlance_events::EventProducer;
use parlance_provisioner::{BackupOperator, JobStatus};
use parlance_store::Store;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::supervisor::{for_each_bounded, record_transition, try_lock, unlock, Supervisor};

/// Drives backup jobs: schedules each requested backup onto one of the
/// installation's cluster installations, then polls the job to a terminal
/// state. A failed backup is terminal; operators re-trigger.
#[derive(Clone)]
pub struct BackupSupervisor {
    store: Arc<dyn Store>,
    operator: Arc<dyn BackupOperator>,
    events: Arc<EventProducer>,
    instance_id: String,
    concurrency: usize,
}

impl BackupSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        operator: Arc<dyn BackupOperator>,
        events: Arc<EventProducer>,
        instance_id: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        BackupSupervisor {
            store,
            operator,
            events,
            instance_id: instance_id.into(),
            concurrency: concurrency.max(1),
        }
    }

    async fn supervise(&self, candidate: InstallationBackup) {
        let id = candidate.id.to_string();
        if !try_lock(&self.store, ResourceType::InstallationBackup, &id, &self.instance_id).await
        {
            return;
        }

        let reloaded = match self.store.get_backup(candidate.id).await {
            Ok(Some(backup)) => backup,
            Ok(None) => {
                unlock(&self.store, ResourceType::InstallationBackup, &id, &self.instance_id)
                    .await;
                return;
            }
            Err(err) => {
                warn!(backup_id = %id, error = %err, "failed to reload backup");
                unlock(&self.store, ResourceType::InstallationBackup, &id, &self.instance_id)
                    .await;
                return;
            }
        };
        if !reloaded.state.pending_work() {
            unlock(&self.store, ResourceType::InstallationBackup, &id, &self.instance_id).await;
            return;
        }

        let mut backup = reloaded;
        let old_state = backup.state;
        let result = match backup.state {
            BackupState::BackupRequested => self.start(&mut backup).await,
            BackupState::BackupInProgress => self.poll(&backup).await,
            BackupState::BackupSucceeded | BackupState::BackupFailed => Ok(backup.state),
        };
        match result {
            Ok(next) => backup.state = next,
            Err(err) => {
                warn!(
                    backup_id = %id,
                    state = %backup.state,
                    error = %err,
                    "backup transition failed"
                );
                if err.is_permanent() {
                    backup.state = BackupState::BackupFailed;
                }
            }
        }
        debug!(
            backup_id = %id,
            old_state = %old_state,
            new_state = %backup.state,
            "backup supervised"
        );

        match self.store.update_backup(&backup).await {
            Err(err) => warn!(backup_id = %id, error = %err, "failed to persist backup"),
            Ok(()) if backup.state != old_state => {
                let mut extra = BTreeMap::new();
                extra.insert(
                    "installation_id".to_string(),
                    backup.installation_id.to_string(),
                );
                record_transition(
                    &self.events,
                    ResourceType::InstallationBackup,
                    &id,
                    old_state.as_str(),
                    backup.state.as_str(),
                    extra,
                )
                .await;
            }
            Ok(()) => {}
        }

        unlock(&self.store, ResourceType::InstallationBackup, &id, &self.instance_id).await;
    }

    async fn start(
        &self,
        backup: &mut InstallationBackup,
    ) -> Result<BackupState, SupervisorError> {
        let installation = self
            .store
            .get_installation(&backup.installation_id)
            .await?
            .ok_or_else(|| {
                SupervisorError::Invariant(format!(
                    "installation {} is gone",
                    backup.installation_id
                ))
            })?;

        let cluster_installations = self
            .store
            .cluster_installations_for_installation(&backup.installation_id)
            .await?;
        let target = cluster_installations
            .into_iter()
            .find(|ci| ci.state == ClusterInstallationState::Stable)
            .ok_or_else(|| {
                SupervisorError::Invariant(format!(
                    "installation {} has no stable cluster installation to back up from",
                    backup.installation_id
                ))
            })?;

        let residence = self.operator.trigger_backup(&installation, &target).await?;
        backup.cluster_installation_id = Some(target.id.clone());
        backup.data_residence = Some(residence);
        backup.started_at = Some(Utc::now());
        info!(
            backup_id = %backup.id,
            installation_id = %backup.installation_id,
            cluster_installation_id = %target.id,
            "backup job dispatched"
        );
        Ok(BackupState::BackupInProgress)
    }

    async fn poll(&self, backup: &InstallationBackup) -> Result<BackupState, SupervisorError> {
        match self.operator.check_backup_status(backup).await? {
            JobStatus::Running => Ok(BackupState::BackupInProgress),
            JobStatus::Succeeded => {
                info!(backup_id = %backup.id, "backup succeeded");
                Ok(BackupState::BackupSucceeded)
            }
            JobStatus::Failed => {
                warn!(backup_id = %backup.id, "backup job failed");
                Ok(BackupState::BackupFailed)
            }
        }
    }
}

#[async_trait]
impl Supervisor for BackupSupervisor {
    fn name(&self) -> &'static str {
        "installation_backup"
    }

    async fn do_work(&self) {
        let backups = match self.store.backups_pending_work().await {
            Ok(backups) => backups,
            Err(err) => {
                warn!(error = %err, "failed to scan backups pending work");
                return;
            }
        };
        let this = self.clone();
        for_each_bounded(backups, self.concurrency, move |backup| {
            let this = this.clone();
            async move { this.supervise(backup).await }
        })
        .await;
    }
}
