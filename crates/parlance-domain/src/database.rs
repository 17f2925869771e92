use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::InstallationId;

/// A shared database cluster hosting multiple installations.
///
/// Invariants: the summed weight of hosted installations stays within the
/// configured maximum (checked at migration trigger time), and an
/// installation never appears in both `installation_ids` and
/// `migrated_installation_ids` of the same database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultitenantDatabase {
    pub id: String,
    pub installation_ids: Vec<InstallationId>,
    /// Installations whose data was migrated away but still lives here until
    /// cleanup. A database never accepts one of these back without cleanup.
    pub migrated_installation_ids: Vec<InstallationId>,
    pub weight_sum: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MultitenantDatabase {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        MultitenantDatabase {
            id: id.into(),
            installation_ids: Vec::new(),
            migrated_installation_ids: Vec::new(),
            weight_sum: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn hosts(&self, installation_id: &InstallationId) -> bool {
        self.installation_ids.contains(installation_id)
    }

    pub fn holds_migrated(&self, installation_id: &InstallationId) -> bool {
        self.migrated_installation_ids.contains(installation_id)
    }

    /// Add an installation and its weight. No-op when already hosted.
    pub fn add_installation(&mut self, installation_id: InstallationId, weight: f64) {
        if self.hosts(&installation_id) {
            return;
        }
        self.installation_ids.push(installation_id);
        self.weight_sum += weight;
    }

    /// Move an installation to the migrated list, subtracting its weight.
    /// No-op when the installation is not hosted here.
    pub fn mark_migrated_out(&mut self, installation_id: &InstallationId, weight: f64) {
        let Some(pos) = self.installation_ids.iter().position(|id| id == installation_id) else {
            return;
        };
        self.installation_ids.remove(pos);
        self.weight_sum = (self.weight_sum - weight).max(0.0);
        if !self.holds_migrated(installation_id) {
            self.migrated_installation_ids.push(installation_id.clone());
        }
    }
}
