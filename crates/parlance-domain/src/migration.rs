use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::installation::InstallationState;
use crate::types::{InstallationId, Lease};

// ── Database restoration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestorationState {
    Requested,
    InProgress,
    Succeeded,
    Failed,
}

impl RestorationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestorationState::Requested => "requested",
            RestorationState::InProgress => "in-progress",
            RestorationState::Succeeded => "succeeded",
            RestorationState::Failed => "failed",
        }
    }

    pub fn pending_work(&self) -> bool {
        matches!(self, RestorationState::Requested | RestorationState::InProgress)
    }

    pub fn finished(&self) -> bool {
        !self.pending_work()
    }
}

impl std::fmt::Display for RestorationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A database restoration of one backup onto one installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationDbRestoration {
    pub id: Uuid,
    pub installation_id: InstallationId,
    pub backup_id: Uuid,
    /// State the installation returns to once the restoration finishes.
    pub target_installation_state: InstallationState,
    pub state: RestorationState,
    #[serde(default)]
    pub lease: Lease,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstallationDbRestoration {
    pub fn new(
        installation_id: InstallationId,
        backup_id: Uuid,
        target_installation_state: InstallationState,
        now: DateTime<Utc>,
    ) -> Self {
        InstallationDbRestoration {
            id: Uuid::new_v4(),
            installation_id,
            backup_id,
            target_installation_state,
            state: RestorationState::Requested,
            lease: Lease::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Database migration ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationState {
    Requested,
    InstallationBackupInProgress,
    DatabaseSwitch,
    Refinalization,
    Succeeded,
    Failed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Requested => "requested",
            MigrationState::InstallationBackupInProgress => "installation-backup-in-progress",
            MigrationState::DatabaseSwitch => "database-switch",
            MigrationState::Refinalization => "refinalization",
            MigrationState::Succeeded => "succeeded",
            MigrationState::Failed => "failed",
        }
    }

    pub fn pending_work(&self) -> bool {
        !matches!(self, MigrationState::Succeeded | MigrationState::Failed)
    }

    pub fn finished(&self) -> bool {
        !self.pending_work()
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Migration of one installation's database to a different shared database
/// cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationDbMigration {
    pub id: Uuid,
    pub installation_id: InstallationId,
    pub source_database: String,
    pub destination_database: String,
    /// Safety backup taken during the first phase of the migration.
    pub backup_id: Option<Uuid>,
    pub state: MigrationState,
    #[serde(default)]
    pub lease: Lease,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstallationDbMigration {
    pub fn new(
        installation_id: InstallationId,
        source_database: impl Into<String>,
        destination_database: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        InstallationDbMigration {
            id: Uuid::new_v4(),
            installation_id,
            source_database: source_database.into(),
            destination_database: destination_database.into(),
            backup_id: None,
            state: MigrationState::Requested,
            lease: Lease::default(),
            created_at: now,
            updated_at: now,
        }
    }
}
