use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn new(s: impl Into<String>) -> Self {
        ClusterId(s.into())
    }

    pub fn generate() -> Self {
        ClusterId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstallationId(pub String);

impl InstallationId {
    pub fn new(s: impl Into<String>) -> Self {
        InstallationId(s.into())
    }

    pub fn generate() -> Self {
        InstallationId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstallationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterInstallationId(pub String);

impl ClusterInstallationId {
    pub fn new(s: impl Into<String>) -> Self {
        ClusterInstallationId(s.into())
    }

    pub fn generate() -> Self {
        ClusterInstallationId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClusterInstallationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Resource kinds ───────────────────────────────────────────────────────────

/// Every kind of resource a supervisor can advance. Doubles as the key space
/// of the store's generic lease operations and as the `ResourceType` field of
/// state-change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cluster,
    Installation,
    ClusterInstallation,
    InstallationBackup,
    InstallationDbRestoration,
    InstallationDbMigration,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "cluster",
            ResourceType::Installation => "installation",
            ResourceType::ClusterInstallation => "cluster_installation",
            ResourceType::InstallationBackup => "installation_backup",
            ResourceType::InstallationDbRestoration => "installation_db_restoration",
            ResourceType::InstallationDbMigration => "installation_db_migration",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "cluster" => ResourceType::Cluster,
            "installation" => ResourceType::Installation,
            "cluster_installation" => ResourceType::ClusterInstallation,
            "installation_backup" => ResourceType::InstallationBackup,
            "installation_db_restoration" => ResourceType::InstallationDbRestoration,
            "installation_db_migration" => ResourceType::InstallationDbMigration,
            other => return Err(DomainError::UnknownResourceType(other.to_string())),
        })
    }
}

// ── Lease ────────────────────────────────────────────────────────────────────

/// Advisory exclusive claim on a resource. Carried inline on every lockable
/// entity; the store mutates it under its own synchronisation so acquisition
/// is compare-and-swap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub locker_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn is_locked(&self) -> bool {
        self.locker_id.is_some()
    }

    pub fn is_held_by(&self, locker_id: &str) -> bool {
        self.locker_id.as_deref() == Some(locker_id)
    }

    /// Acquire the lease for `locker_id`. Idempotent for the current holder.
    /// Returns whether the caller now holds the lease.
    pub fn acquire(&mut self, locker_id: &str, now: DateTime<Utc>) -> bool {
        match self.locker_id.as_deref() {
            None => {
                self.locker_id = Some(locker_id.to_string());
                self.locked_at = Some(now);
                true
            }
            Some(current) => current == locker_id,
        }
    }

    /// Release the lease. Only the holder may release unless `force` is set.
    /// Returns whether the lease is unlocked afterwards.
    pub fn release(&mut self, locker_id: &str, force: bool) -> bool {
        match self.locker_id.as_deref() {
            None => true,
            Some(current) if current == locker_id || force => {
                self.locker_id = None;
                self.locked_at = None;
                true
            }
            Some(_) => false,
        }
    }
}

// ── Warning ──────────────────────────────────────────────────────────────────

/// Operator-visible record of the most recent failed step on a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl Warning {
    pub fn new(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Warning { message: message.into(), occurred_at: now }
    }
}
