use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ClusterInstallationId, InstallationId, Lease};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupState {
    BackupRequested,
    BackupInProgress,
    BackupSucceeded,
    BackupFailed,
}

impl BackupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupState::BackupRequested => "backup-requested",
            BackupState::BackupInProgress => "backup-in-progress",
            BackupState::BackupSucceeded => "backup-succeeded",
            BackupState::BackupFailed => "backup-failed",
        }
    }

    /// Both terminal states require no further supervision; a failed backup
    /// is not retried automatically.
    pub fn pending_work(&self) -> bool {
        matches!(self, BackupState::BackupRequested | BackupState::BackupInProgress)
    }

    pub fn is_running(&self) -> bool {
        self.pending_work()
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the backed-up data physically lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResidence {
    pub region: String,
    /// Bucket URL, e.g. `s3://backups-us-east-1`.
    pub url: String,
    pub object_key: String,
}

/// One backup attempt of one installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationBackup {
    pub id: Uuid,
    pub installation_id: InstallationId,
    pub state: BackupState,
    /// The cluster installation the backup job was scheduled onto. Chosen by
    /// the backup supervisor at dispatch time.
    pub cluster_installation_id: Option<ClusterInstallationId>,
    pub data_residence: Option<DataResidence>,
    #[serde(default)]
    pub lease: Lease,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstallationBackup {
    pub fn new(installation_id: InstallationId, now: DateTime<Utc>) -> Self {
        InstallationBackup {
            id: Uuid::new_v4(),
            installation_id,
            state: BackupState::BackupRequested,
            cluster_installation_id: None,
            data_residence: None,
            lease: Lease::default(),
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
