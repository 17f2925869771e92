use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::types::{InstallationId, Lease, Warning};

// ── Lifecycle state machine ───────────────────────────────────────────────────

/// The lifecycle state of a tenant installation.
///
/// Main line:
///   CreationRequested → CreationInProgress → CreationDns → Stable
/// Branches:
///   UpdateRequested → UpdateInProgress → Stable
///   HibernationRequested → HibernationInProgress → Hibernating
///   WakeUpRequested → UpdateInProgress → Stable
///   DeletionPendingRequested → DeletionPending
///   DeletionRequested → DeletionInProgress → DeletionFinalCleanup → Deleted
///
/// The Db* parked states are owned by the restoration/migration supervisors;
/// the installation supervisor never picks them up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallationState {
    CreationRequested,
    CreationInProgress,
    CreationDns,
    CreationFailed,
    Stable,
    UpdateRequested,
    UpdateInProgress,
    UpdateFailed,
    HibernationRequested,
    HibernationInProgress,
    Hibernating,
    WakeUpRequested,
    DeletionPendingRequested,
    DeletionPending,
    DeletionRequested,
    DeletionInProgress,
    DeletionFinalCleanup,
    DeletionFailed,
    Deleted,
    DbRestorationInProgress,
    DbRestorationFailed,
    DbMigrationInProgress,
    DbMigrationFailed,
    ImportInProgress,
}

impl InstallationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationState::CreationRequested => "creation-requested",
            InstallationState::CreationInProgress => "creation-in-progress",
            InstallationState::CreationDns => "creation-dns",
            InstallationState::CreationFailed => "creation-failed",
            InstallationState::Stable => "stable",
            InstallationState::UpdateRequested => "update-requested",
            InstallationState::UpdateInProgress => "update-in-progress",
            InstallationState::UpdateFailed => "update-failed",
            InstallationState::HibernationRequested => "hibernation-requested",
            InstallationState::HibernationInProgress => "hibernation-in-progress",
            InstallationState::Hibernating => "hibernating",
            InstallationState::WakeUpRequested => "wake-up-requested",
            InstallationState::DeletionPendingRequested => "deletion-pending-requested",
            InstallationState::DeletionPending => "deletion-pending",
            InstallationState::DeletionRequested => "deletion-requested",
            InstallationState::DeletionInProgress => "deletion-in-progress",
            InstallationState::DeletionFinalCleanup => "deletion-final-cleanup",
            InstallationState::DeletionFailed => "deletion-failed",
            InstallationState::Deleted => "deleted",
            InstallationState::DbRestorationInProgress => "db-restoration-in-progress",
            InstallationState::DbRestorationFailed => "db-restoration-failed",
            InstallationState::DbMigrationInProgress => "db-migration-in-progress",
            InstallationState::DbMigrationFailed => "db-migration-failed",
            InstallationState::ImportInProgress => "import-in-progress",
        }
    }

    /// Whether the installation supervisor should pick this installation up.
    pub fn pending_work(&self) -> bool {
        !matches!(
            self,
            InstallationState::Stable
                | InstallationState::Hibernating
                | InstallationState::DeletionPending
                | InstallationState::Deleted
                | InstallationState::DbRestorationInProgress
                | InstallationState::DbRestorationFailed
                | InstallationState::DbMigrationInProgress
                | InstallationState::DbMigrationFailed
                | InstallationState::ImportInProgress
        )
    }

    /// States from which a new lifecycle sub-operation (backup, restoration,
    /// migration, import) may be started.
    pub fn accepts_operations(&self) -> bool {
        matches!(self, InstallationState::Stable | InstallationState::Hibernating)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, InstallationState::Deleted)
    }
}

impl std::fmt::Display for InstallationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Sizing ────────────────────────────────────────────────────────────────────

/// T-shirt size of an installation. Drives resource requests and the
/// scheduling weight it contributes to a shared database cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallationSize {
    #[serde(rename = "100users")]
    Users100,
    #[serde(rename = "1000users")]
    Users1000,
    #[serde(rename = "5000users")]
    Users5000,
    #[serde(rename = "25000users")]
    Users25000,
}

impl InstallationSize {
    pub fn weight(&self) -> f64 {
        match self {
            InstallationSize::Users100 => 1.0,
            InstallationSize::Users1000 => 2.0,
            InstallationSize::Users5000 => 4.0,
            InstallationSize::Users25000 => 8.0,
        }
    }
}

impl std::fmt::Display for InstallationSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallationSize::Users100 => write!(f, "100users"),
            InstallationSize::Users1000 => write!(f, "1000users"),
            InstallationSize::Users5000 => write!(f, "5000users"),
            InstallationSize::Users25000 => write!(f, "25000users"),
        }
    }
}

/// Which database backing an installation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseKind {
    SingleTenantRds,
    MultitenantRds,
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseKind::SingleTenantRds => write!(f, "single-tenant-rds"),
            DatabaseKind::MultitenantRds => write!(f, "multitenant-rds"),
        }
    }
}

/// Which file store backing an installation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilestoreKind {
    S3,
    MultitenantS3,
}

impl std::fmt::Display for FilestoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilestoreKind::S3 => write!(f, "s3"),
            FilestoreKind::MultitenantS3 => write!(f, "multitenant-s3"),
        }
    }
}

// ── Installation ──────────────────────────────────────────────────────────────

/// A tenant deployment of the chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub id: InstallationId,
    /// Public DNS name. Unique among live installations (store-enforced).
    pub dns: String,
    pub size: InstallationSize,
    pub image: String,
    pub version: String,
    pub license: Option<String>,
    pub database: DatabaseKind,
    pub filestore: FilestoreKind,
    /// Group affinity for rolling configuration out in batches.
    pub group_id: Option<String>,
    pub state: InstallationState,
    #[serde(default)]
    pub lease: Lease,
    pub last_warning: Option<Warning>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Installation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dns: impl Into<String>,
        size: InstallationSize,
        image: impl Into<String>,
        version: impl Into<String>,
        database: DatabaseKind,
        filestore: FilestoreKind,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let dns = dns.into();
        if dns.is_empty() || !dns.contains('.') {
            return Err(DomainError::InvalidDns(dns));
        }
        Ok(Installation {
            id: InstallationId::generate(),
            dns,
            size,
            image: image.into(),
            version: version.into(),
            license: None,
            database,
            filestore,
            group_id: None,
            state: InstallationState::CreationRequested,
            lease: Lease::default(),
            last_warning: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn record_warning(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.last_warning = Some(Warning::new(message, now));
    }

    /// The scheduling weight this installation contributes to a shared
    /// database cluster.
    pub fn weight(&self) -> f64 {
        self.size.weight()
    }
}
