use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parlance_domain::{
    BackupState, Installation, InstallationBackup, InstallationDbMigration, InstallationState,
    MigrationState, ResourceType,
};
use parlance_events::EventProducer;
use parlance_provisioner::DatabaseOperator;
use parlance_store::Store;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::supervisor::{
    for_each_bounded, record_transition, set_installation_state, try_lock, unlock, Supervisor,
};

/// Drives database migrations: safety backup, switch to the destination
/// database cluster, refinalization, then bookkeeping on both shared
/// databases. The backup phase is delegated to the backup supervisor via an
/// ordinary backup record.
#[derive(Clone)]
pub struct MigrationSupervisor {
    store: Arc<dyn Store>,
    operator: Arc<dyn DatabaseOperator>,
    events: Arc<EventProducer>,
    instance_id: String,
    concurrency: usize,
}

impl MigrationSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        operator: Arc<dyn DatabaseOperator>,
        events: Arc<EventProducer>,
        instance_id: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        MigrationSupervisor {
            store,
            operator,
            events,
            instance_id: instance_id.into(),
            concurrency: concurrency.max(1),
        }
    }

    async fn supervise(&self, candidate: InstallationDbMigration) {
        let id = candidate.id.to_string();
        if !try_lock(
            &self.store,
            ResourceType::InstallationDbMigration,
            &id,
            &self.instance_id,
        )
        .await
        {
            return;
        }

        let reloaded = match self.store.get_migration(candidate.id).await {
            Ok(Some(migration)) => migration,
            Ok(None) => {
                unlock(
                    &self.store,
                    ResourceType::InstallationDbMigration,
                    &id,
                    &self.instance_id,
                )
                .await;
                return;
            }
            Err(err) => {
                warn!(migration_id = %id, error = %err, "failed to reload migration");
                unlock(
                    &self.store,
                    ResourceType::InstallationDbMigration,
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
                ResourceType::InstallationDbMigration,
                &id,
                &self.instance_id,
            )
            .await;
            return;
        }

        let mut migration = reloaded;
        let old_state = migration.state;
        let result = match migration.state {
            MigrationState::Requested => self.take_safety_backup(&mut migration).await,
            MigrationState::InstallationBackupInProgress => {
                self.await_safety_backup(&migration).await
            }
            MigrationState::DatabaseSwitch => self.switch(&migration).await,
            MigrationState::Refinalization => self.refinalize(&migration).await,
            MigrationState::Succeeded | MigrationState::Failed => Ok(migration.state),
        };
        match result {
            Ok(next) => migration.state = next,
            Err(err) => {
                warn!(
                    migration_id = %id,
                    state = %migration.state,
                    error = %err,
                    "migration transition failed"
                );
                if err.is_permanent() {
                    migration.state = MigrationState::Failed;
                    self.park_installation(&migration, InstallationState::DbMigrationFailed)
                        .await;
                }
            }
        }
        debug!(
            migration_id = %id,
            old_state = %old_state,
            new_state = %migration.state,
            "migration supervised"
        );

        match self.store.update_migration(&migration).await {
            Err(err) => warn!(migration_id = %id, error = %err, "failed to persist migration"),
            Ok(()) if migration.state != old_state => {
                let mut extra = BTreeMap::new();
                extra.insert(
                    "installation_id".to_string(),
                    migration.installation_id.to_string(),
                );
                extra.insert("source".to_string(), migration.source_database.clone());
                extra.insert(
                    "destination".to_string(),
                    migration.destination_database.clone(),
                );
                record_transition(
                    &self.events,
                    ResourceType::InstallationDbMigration,
                    &id,
                    old_state.as_str(),
                    migration.state.as_str(),
                    extra,
                )
                .await;
            }
            Ok(()) => {}
        }

        unlock(
            &self.store,
            ResourceType::InstallationDbMigration,
            &id,
            &self.instance_id,
        )
        .await;
    }

    /// A migration starts with an ordinary backup record; the backup
    /// supervisor runs the job while this one polls the record.
    async fn take_safety_backup(
        &self,
        migration: &mut InstallationDbMigration,
    ) -> Result<MigrationState, SupervisorError> {
        if migration.backup_id.is_none() {
            let backup = InstallationBackup::new(migration.installation_id.clone(), Utc::now());
            self.store.create_backup(&backup).await?;
            migration.backup_id = Some(backup.id);
            info!(
                migration_id = %migration.id,
                backup_id = %backup.id,
                "safety backup requested"
            );
        }
        Ok(MigrationState::InstallationBackupInProgress)
    }

    async fn await_safety_backup(
        &self,
        migration: &InstallationDbMigration,
    ) -> Result<MigrationState, SupervisorError> {
        let Some(backup_id) = migration.backup_id else {
            // The requested step crashed before persisting; redo it.
            return Ok(MigrationState::Requested);
        };
        let backup = self.store.get_backup(backup_id).await?.ok_or_else(|| {
            SupervisorError::Invariant(format!("safety backup {backup_id} is gone"))
        })?;
        match backup.state {
            BackupState::BackupSucceeded => Ok(MigrationState::DatabaseSwitch),
            BackupState::BackupFailed => {
                warn!(migration_id = %migration.id, "safety backup failed, failing migration");
                self.park_installation(migration, InstallationState::DbMigrationFailed).await;
                Ok(MigrationState::Failed)
            }
            _ => Ok(MigrationState::InstallationBackupInProgress),
        }
    }

    async fn switch(
        &self,
        migration: &InstallationDbMigration,
    ) -> Result<MigrationState, SupervisorError> {
        let installation = self.installation(migration).await?;
        self.operator
            .switch_database(
                &installation,
                &migration.source_database,
                &migration.destination_database,
            )
            .await?;
        info!(
            migration_id = %migration.id,
            destination = %migration.destination_database,
            "database switched"
        );
        Ok(MigrationState::Refinalization)
    }

    async fn refinalize(
        &self,
        migration: &InstallationDbMigration,
    ) -> Result<MigrationState, SupervisorError> {
        let installation = self.installation(migration).await?;
        self.operator.refinalize(&installation).await?;
        self.record_database_move(migration, &installation).await?;
        self.park_installation(migration, InstallationState::Hibernating).await;
        info!(migration_id = %migration.id, "migration refinalized");
        Ok(MigrationState::Succeeded)
    }

    /// Move the installation's weight from the source database to the
    /// destination. The source keeps the id in its migrated list until its
    /// data is cleaned up.
    async fn record_database_move(
        &self,
        migration: &InstallationDbMigration,
        installation: &Installation,
    ) -> Result<(), SupervisorError> {
        let weight = installation.weight();

        if let Some(mut source) = self
            .store
            .get_multitenant_database(&migration.source_database)
            .await?
        {
            source.mark_migrated_out(&installation.id, weight);
            self.store.update_multitenant_database(&source).await?;
        }

        let mut destination = self
            .store
            .get_multitenant_database(&migration.destination_database)
            .await?
            .ok_or_else(|| {
                SupervisorError::Invariant(format!(
                    "destination database {} is gone",
                    migration.destination_database
                ))
            })?;
        destination.add_installation(installation.id.clone(), weight);
        self.store.update_multitenant_database(&destination).await?;
        Ok(())
    }

    async fn installation(
        &self,
        migration: &InstallationDbMigration,
    ) -> Result<Installation, SupervisorError> {
        self.store
            .get_installation(&migration.installation_id)
            .await?
            .ok_or_else(|| {
                SupervisorError::Invariant(format!(
                    "installation {} is gone",
                    migration.installation_id
                ))
            })
    }

    async fn park_installation(
        &self,
        migration: &InstallationDbMigration,
        state: InstallationState,
    ) {
        if let Err(err) = set_installation_state(
            &self.store,
            &self.events,
            &self.instance_id,
            &migration.installation_id,
            state,
        )
        .await
        {
            warn!(
                migration_id = %migration.id,
                installation_id = %migration.installation_id,
                error = %err,
                "failed to hand installation back"
            );
        }
    }
}

#[async_trait]
impl Supervisor for MigrationSupervisor {
    fn name(&self) -> &'static str {
        "installation_db_migration"
    }

    async fn do_work(&self) {
        let migrations = match self.store.migrations_pending_work().await {
            Ok(migrations) => migrations,
            Err(err) => {
                warn!(error = %err, "failed to scan migrations pending work");
                return;
            }
        };
        let this = self.clone();
        for_each_bounded(migrations, self.concurrency, move |migration| {
            let this = this.clone();
            async move { this.supervise(migration).await }
        })
        .await;
    }
}
