//! Synchronous entry points that start lifecycle operations.
//!
//! Each one validates the invariants, persists the new operation in its
//! initial state, and lets the supervisors pick it up on their next tick.
//! Errors carry an HTTP-style status recoverable with
//! [`parlance_domain::status_code`].

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parlance_domain::{
    status_error, BackupState, Installation, InstallationBackup, InstallationDbMigration,
    InstallationDbRestoration, InstallationId, InstallationState, MultitenantDatabase,
    ResourceType,
};
use parlance_events::EventProducer;
use parlance_store::Store;
use tracing::{info, warn};
use uuid::Uuid;

/// Request a new backup of an installation.
pub async fn trigger_installation_backup(
    store: &Arc<dyn Store>,
    events: &EventProducer,
    installation_id: &InstallationId,
) -> Result<InstallationBackup> {
    let installation = get_installation(store, installation_id).await?;
    if !installation.state.accepts_operations() {
        return Err(status_error(
            400,
            format!(
                "installation must be stable or hibernating to back up, is {}",
                installation.state
            ),
        ));
    }
    if store
        .running_backup_for_installation(installation_id)
        .await?
        .is_some()
    {
        return Err(status_error(
            400,
            "another backup is already running for this installation",
        ));
    }

    let backup = InstallationBackup::new(installation_id.clone(), Utc::now());
    store.create_backup(&backup).await?;
    info!(
        backup_id = %backup.id,
        installation_id = %installation_id,
        "backup requested"
    );
    record_request(
        events,
        ResourceType::InstallationBackup,
        &backup.id.to_string(),
        BackupState::BackupRequested.as_str(),
        installation_id,
    )
    .await;
    Ok(backup)
}

/// The gate in front of a database restoration: installation hibernating,
/// backup usable and owned by the installation, no other restoration active.
pub async fn ensure_installation_ready_for_db_restoration(
    store: &Arc<dyn Store>,
    installation: &Installation,
    backup: &InstallationBackup,
) -> Result<()> {
    if installation.state != InstallationState::Hibernating {
        return Err(status_error(
            400,
            format!(
                "installation must be hibernating for a database restoration, is {}",
                installation.state
            ),
        ));
    }
    if backup.installation_id != installation.id {
        return Err(status_error(
            400,
            "backup belongs to a different installation",
        ));
    }
    if backup.state != BackupState::BackupSucceeded {
        return Err(status_error(
            400,
            format!("backup is not usable for restoration (state {})", backup.state),
        ));
    }
    if store
        .unfinished_restoration_for_installation(&installation.id)
        .await?
        .is_some()
    {
        return Err(status_error(
            400,
            "another database restoration is already active for this installation",
        ));
    }
    Ok(())
}

/// Request a database restoration of `backup_id` onto an installation.
/// The installation parks in `db-restoration-in-progress` until the
/// restoration supervisor hands it back.
pub async fn trigger_installation_db_restoration(
    store: &Arc<dyn Store>,
    events: &EventProducer,
    installation_id: &InstallationId,
    backup_id: Uuid,
) -> Result<InstallationDbRestoration> {
    let mut installation = get_installation(store, installation_id).await?;
    let backup = store
        .get_backup(backup_id)
        .await?
        .ok_or_else(|| status_error(404, format!("backup {backup_id} not found")))?;
    ensure_installation_ready_for_db_restoration(store, &installation, &backup).await?;
    ensure_no_running_backup(store, installation_id).await?;

    let restoration = InstallationDbRestoration::new(
        installation_id.clone(),
        backup_id,
        installation.state,
        Utc::now(),
    );
    store.create_restoration(&restoration).await?;

    let old_state = installation.state;
    installation.state = InstallationState::DbRestorationInProgress;
    store.update_installation(&installation).await?;
    info!(
        restoration_id = %restoration.id,
        installation_id = %installation_id,
        backup_id = %backup_id,
        "database restoration requested"
    );
    record_transition_event(
        events,
        ResourceType::Installation,
        installation_id.as_str(),
        old_state.as_str(),
        installation.state.as_str(),
    )
    .await;
    Ok(restoration)
}

/// The gate in front of a database migration: the destination must not hold
/// stale migrated data for the installation and must have headroom.
pub fn validate_db_migration_destination(
    destination: &MultitenantDatabase,
    installation_id: &InstallationId,
    max_weight: f64,
) -> Result<()> {
    if destination.holds_migrated(installation_id) {
        return Err(status_error(
            400,
            format!(
                "destination database {} still holds migrated data for this installation; \
                 clean it up first",
                destination.id
            ),
        ));
    }
    if destination.weight_sum >= max_weight {
        return Err(status_error(
            400,
            format!(
                "destination database {} is at capacity ({} of {})",
                destination.id, destination.weight_sum, max_weight
            ),
        ));
    }
    Ok(())
}

/// Request a migration of an installation's database to another shared
/// database cluster.
pub async fn trigger_installation_db_migration(
    store: &Arc<dyn Store>,
    events: &EventProducer,
    installation_id: &InstallationId,
    destination_database: &str,
    max_weight: f64,
) -> Result<InstallationDbMigration> {
    let mut installation = get_installation(store, installation_id).await?;
    if installation.state != InstallationState::Hibernating {
        return Err(status_error(
            400,
            format!(
                "installation must be hibernating for a database migration, is {}",
                installation.state
            ),
        ));
    }

    let source = store
        .multitenant_database_for_installation(installation_id)
        .await?
        .ok_or_else(|| {
            status_error(400, "installation is not hosted on a multitenant database")
        })?;
    if source.id == destination_database {
        return Err(status_error(
            400,
            "destination database is the same as the source",
        ));
    }
    let destination = store
        .get_multitenant_database(destination_database)
        .await?
        .ok_or_else(|| {
            status_error(404, format!("database {destination_database} not found"))
        })?;
    validate_db_migration_destination(&destination, installation_id, max_weight)?;

    if store
        .unfinished_migration_for_installation(installation_id)
        .await?
        .is_some()
    {
        return Err(status_error(
            400,
            "another database migration is already active for this installation",
        ));
    }
    ensure_no_running_backup(store, installation_id).await?;

    let migration = InstallationDbMigration::new(
        installation_id.clone(),
        source.id.clone(),
        destination_database,
        Utc::now(),
    );
    store.create_migration(&migration).await?;

    let old_state = installation.state;
    installation.state = InstallationState::DbMigrationInProgress;
    store.update_installation(&installation).await?;
    info!(
        migration_id = %migration.id,
        installation_id = %installation_id,
        source = %source.id,
        destination = destination_database,
        "database migration requested"
    );
    record_transition_event(
        events,
        ResourceType::Installation,
        installation_id.as_str(),
        old_state.as_str(),
        installation.state.as_str(),
    )
    .await;
    Ok(migration)
}

/// An installation runs at most one lifecycle sub-operation at a time; a
/// backup in flight blocks restorations and migrations.
async fn ensure_no_running_backup(
    store: &Arc<dyn Store>,
    installation_id: &InstallationId,
) -> Result<()> {
    if store
        .running_backup_for_installation(installation_id)
        .await?
        .is_some()
    {
        return Err(status_error(
            400,
            "a backup is currently running for this installation",
        ));
    }
    Ok(())
}

async fn get_installation(
    store: &Arc<dyn Store>,
    installation_id: &InstallationId,
) -> Result<Installation> {
    store
        .get_installation(installation_id)
        .await?
        .ok_or_else(|| status_error(404, format!("installation {installation_id} not found")))
}

async fn record_request(
    events: &EventProducer,
    resource_type: ResourceType,
    id: &str,
    initial_state: &str,
    installation_id: &InstallationId,
) {
    let mut extra = BTreeMap::new();
    extra.insert("installation_id".to_string(), installation_id.to_string());
    if let Err(err) = events
        .produce(resource_type, id, "n/a", initial_state, extra)
        .await
    {
        warn!(resource_id = id, error = %err, "failed to record trigger event");
    }
}

async fn record_transition_event(
    events: &EventProducer,
    resource_type: ResourceType,
    id: &str,
    old_state: &str,
    new_state: &str,
) {
    if let Err(err) = events
        .produce(resource_type, id, old_state, new_state, BTreeMap::new())
        .await
    {
        warn!(resource_id = id, error = %err, "failed to record trigger event");
    }
}
