use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parlance_domain::{
    BackupState, InstallationDbRestoration, InstallationState, ResourceType, RestorationState,
};
use parlance_events::EventProducer;
use parlance_provisioner::{DatabaseOperator, JobStatus};
use parlance_store::Store;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::supervisor::{
    for_each_bounded, record_transition, set_installation_state, try_lock, unlock, Supervisor,
};

/// Drives database restorations. The installation stays parked in
/// `db-restoration-in-progress` while the job runs, then returns to the
/// operation's target state (or `db-restoration-failed`).
#[derive(Clone)]
pub struct RestorationSupervisor {
    store: Arc<dyn Store>,
    operator: Arc<dyn DatabaseOperator>,
    events: Arc<EventProducer>,
    instance_id: String,
    concurrency: usize,
}

impl RestorationSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        operator: Arc<dyn DatabaseOperator>,
        events: Arc<EventProducer>,
        instance_id: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        RestorationSupervisor {
            store,
            operator,
            events,
            instance_id: instance_id.into(),
            concurrency: concurrency.max(1),
        }
    }

    async fn supervise(&self, candidate: InstallationDbRestoration) {
        let id = candidate.id.to_string();
        if !try_lock(
            &self.store,
            ResourceType::InstallationDbRestoration,
            &id,
            &self.instance_id,
        )
        .await
        {
            return;
        }

        let reloaded = match self.store.get_restoration(candidate.id).await {
            Ok(Some(restoration)) => restoration,
            Ok(None) => {
                unlock(
                    &self.store,
                    ResourceType::InstallationDbRestoration,
                    &id,
                    &self.instance_id,
                )
                .await;
                return;
            }
            Err(err) => {
                warn!(restoration_id = %id, error = %err, "failed to reload restoration");
                unlock(
                    &self.store,
                    ResourceType::InstallationDbRestoration,
                    &id,
                    &self.instance_id,
                )
                .await;
                return;
            }
        };
        if !reloaded.state.pending_work() {
            unlock(
                &self.store,
                ResourceType::InstallationDbRestoration,
                &id,
                &self.instance_id,
            )
            .await;
            return;
        }

        let mut restoration = reloaded;
        let old_state = restoration.state;
        let result = match restoration.state {
            RestorationState::Requested => self.start(&restoration).await,
            RestorationState::InProgress => self.poll(&restoration).await,
            RestorationState::Succeeded | RestorationState::Failed => Ok(restoration.state),
        };
        match result {
            Ok(next) => restoration.state = next,
            Err(err) => {
                warn!(
                    restoration_id = %id,
                    state = %restoration.state,
                    error = %err,
                    "restoration transition failed"
                );
                if err.is_permanent() {
                    restoration.state = RestorationState::Failed;
                    self.park_installation(&restoration, InstallationState::DbRestorationFailed)
                        .await;
                }
            }
        }
        debug!(
            restoration_id = %id,
            old_state = %old_state,
            new_state = %restoration.state,
            "restoration supervised"
        );

        match self.store.update_restoration(&restoration).await {
            Err(err) => {
                warn!(restoration_id = %id, error = %err, "failed to persist restoration")
            }
            Ok(()) if restoration.state != old_state => {
                let mut extra = BTreeMap::new();
                extra.insert(
                    "installation_id".to_string(),
                    restoration.installation_id.to_string(),
                );
                extra.insert("backup_id".to_string(), restoration.backup_id.to_string());
                record_transition(
                    &self.events,
                    ResourceType::InstallationDbRestoration,
                    &id,
                    old_state.as_str(),
                    restoration.state.as_str(),
                    extra,
                )
                .await;
            }
            Ok(()) => {}
        }

        unlock(
            &self.store,
            ResourceType::InstallationDbRestoration,
            &id,
            &self.instance_id,
        )
        .await;
    }

    async fn start(
        &self,
        restoration: &InstallationDbRestoration,
    ) -> Result<RestorationState, SupervisorError> {
        let installation = self
            .store
            .get_installation(&restoration.installation_id)
            .await?
            .ok_or_else(|| {
                SupervisorError::Invariant(format!(
                    "installation {} is gone",
                    restoration.installation_id
                ))
            })?;
        let backup = self
            .store
            .get_backup(restoration.backup_id)
            .await?
            .ok_or_else(|| {
                SupervisorError::Invariant(format!("backup {} is gone", restoration.backup_id))
            })?;
        if backup.state != BackupState::BackupSucceeded {
            return Err(SupervisorError::Invariant(format!(
                "backup {} is not restorable (state {})",
                backup.id, backup.state
            )));
        }

        self.operator.trigger_restoration(&installation, &backup).await?;
        info!(
            restoration_id = %restoration.id,
            installation_id = %installation.id,
            backup_id = %backup.id,
            "database restoration dispatched"
        );
        Ok(RestorationState::InProgress)
    }

    async fn poll(
        &self,
        restoration: &InstallationDbRestoration,
    ) -> Result<RestorationState, SupervisorError> {
        match self.operator.check_restoration_status(restoration).await? {
            JobStatus::Running => Ok(RestorationState::InProgress),
            JobStatus::Succeeded => {
                info!(restoration_id = %restoration.id, "database restoration succeeded");
                self.park_installation(restoration, restoration.target_installation_state)
                    .await;
                Ok(RestorationState::Succeeded)
            }
            JobStatus::Failed => {
                warn!(restoration_id = %restoration.id, "database restoration failed");
                self.park_installation(restoration, InstallationState::DbRestorationFailed)
                    .await;
                Ok(RestorationState::Failed)
            }
        }
    }

    async fn park_installation(
        &self,
        restoration: &InstallationDbRestoration,
        state: InstallationState,
    ) {
        if let Err(err) = set_installation_state(
            &self.store,
            &self.events,
            &self.instance_id,
            &restoration.installation_id,
            state,
        )
        .await
        {
            warn!(
                restoration_id = %restoration.id,
                installation_id = %restoration.installation_id,
                error = %err,
                "failed to hand installation back"
            );
        }
    }
}

#[async_trait]
impl Supervisor for RestorationSupervisor {
    fn name(&self) -> &'static str {
        "installation_db_restoration"
    }

    async fn do_work(&self) {
        let restorations = match self.store.restorations_pending_work().await {
            Ok(restorations) => restorations,
            Err(err) => {
                warn!(error = %err, "failed to scan restorations pending work");
                return;
            }
        };
        let this = self.clone();
        for_each_bounded(restorations, self.concurrency, move |restoration| {
            let this = this.clone();
            async move { this.supervise(restoration).await }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{drive, test_env, test_installation};
    use chrono::Utc;
    use parlance_domain::InstallationBackup;

    struct Seed {
        installation: parlance_domain::Installation,
        restoration: InstallationDbRestoration,
    }

    async fn seed(env: &crate::testutil::TestEnv) -> Seed {
        let mut installation = test_installation("restore.chat.example.com");
        installation.state = InstallationState::DbRestorationInProgress;
        env.store.create_installation(&installation).await.unwrap();

        let mut backup = InstallationBackup::new(installation.id.clone(), Utc::now());
        backup.state = BackupState::BackupSucceeded;
        env.store.create_backup(&backup).await.unwrap();

        let restoration = InstallationDbRestoration::new(
            installation.id.clone(),
            backup.id,
            InstallationState::Hibernating,
            Utc::now(),
        );
        env.store.create_restoration(&restoration).await.unwrap();
        Seed { installation, restoration }
    }

    #[tokio::test]
    async fn restoration_returns_installation_to_target_state() {
        let env = test_env(1).await;
        let seed = seed(&env).await;

        let supervisor = RestorationSupervisor::new(
            env.store.clone(),
            env.stub.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );

        drive(&supervisor, || async {
            env.store
                .get_restoration(seed.restoration.id)
                .await
                .unwrap()
                .unwrap()
                .state
                == RestorationState::Succeeded
        })
        .await;

        let installation = env
            .store
            .get_installation(&seed.installation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(installation.state, InstallationState::Hibernating);
        assert!(!installation.lease.is_locked());

        let events = env.store.list_state_change_events(100).await.unwrap();
        assert!(events.iter().any(|e| {
            e.resource_type == ResourceType::InstallationDbRestoration
                && e.new_state == "succeeded"
        }));
        assert!(events.iter().any(|e| {
            e.resource_type == ResourceType::Installation && e.new_state == "hibernating"
        }));
    }

    #[tokio::test]
    async fn failed_job_parks_installation_in_failed_state() {
        let env = test_env(0).await;
        let seed = seed(&env).await;
        env.stub.set_fail_jobs(true);

        let supervisor = RestorationSupervisor::new(
            env.store.clone(),
            env.stub.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );

        drive(&supervisor, || async {
            env.store
                .get_restoration(seed.restoration.id)
                .await
                .unwrap()
                .unwrap()
                .state
                == RestorationState::Failed
        })
        .await;

        let installation = env
            .store
            .get_installation(&seed.installation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(installation.state, InstallationState::DbRestorationFailed);
    }

    #[tokio::test]
    async fn unusable_backup_is_a_transient_invariant_error() {
        let env = test_env(0).await;
        let seed = seed(&env).await;
        // Corrupt the seed: flip the backup back to running.
        let mut backup = env
            .store
            .get_backup(seed.restoration.backup_id)
            .await
            .unwrap()
            .unwrap();
        backup.state = BackupState::BackupInProgress;
        env.store.update_backup(&backup).await.unwrap();

        let supervisor = RestorationSupervisor::new(
            env.store.clone(),
            env.stub.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );
        supervisor.do_work().await;

        let stored = env
            .store
            .get_restoration(seed.restoration.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, RestorationState::Requested, "retried next tick");
    }
}
