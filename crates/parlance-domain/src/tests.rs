#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};

    use crate::backup::BackupState;
    use crate::cluster::ClusterState;
    use crate::database::MultitenantDatabase;
    use crate::error::DomainError;
    use crate::event::{EventPayload, StateChangeEvent, WebhookPayload};
    use crate::installation::InstallationState;
    use crate::types::{InstallationId, Lease, ResourceType};

    #[test]
    fn lease_acquire_is_idempotent_for_holder() {
        let now = Utc::now();
        let mut lease = Lease::default();
        assert!(lease.acquire("worker-a", now));
        assert!(lease.acquire("worker-a", now), "same locker must re-acquire");
        assert!(!lease.acquire("worker-b", now), "held lease rejects others");
        assert!(lease.is_held_by("worker-a"));
    }

    #[test]
    fn lease_release_requires_holder_or_force() {
        let now = Utc::now();
        let mut lease = Lease::default();
        lease.acquire("worker-a", now);

        assert!(!lease.release("worker-b", false));
        assert!(lease.is_locked());

        assert!(lease.release("worker-b", true), "force overrides the holder");
        assert!(!lease.is_locked());

        // Releasing an unlocked lease is fine.
        assert!(lease.release("worker-a", false));
    }

    #[test]
    fn cluster_failed_states_are_rescanned() {
        assert!(ClusterState::CreationFailed.pending_work());
        assert!(ClusterState::ProvisioningFailed.pending_work());
        assert!(!ClusterState::Stable.pending_work());
        assert!(!ClusterState::Deleted.pending_work());
    }

    #[test]
    fn installation_parked_states_are_not_supervisor_work() {
        assert!(!InstallationState::DbRestorationInProgress.pending_work());
        assert!(!InstallationState::DbMigrationInProgress.pending_work());
        assert!(!InstallationState::Hibernating.pending_work());
        assert!(InstallationState::CreationRequested.pending_work());
        assert!(InstallationState::WakeUpRequested.pending_work());
    }

    #[test]
    fn backup_terminal_states() {
        assert!(BackupState::BackupRequested.pending_work());
        assert!(!BackupState::BackupSucceeded.pending_work());
        assert!(!BackupState::BackupFailed.pending_work());
    }

    #[test]
    fn resource_type_parses_its_own_labels() {
        let all = [
            ResourceType::Cluster,
            ResourceType::Installation,
            ResourceType::ClusterInstallation,
            ResourceType::InstallationBackup,
            ResourceType::InstallationDbRestoration,
            ResourceType::InstallationDbMigration,
        ];
        for resource_type in all {
            assert_eq!(
                resource_type.as_str().parse::<ResourceType>().unwrap(),
                resource_type
            );
        }
        assert!(matches!(
            "volume".parse::<ResourceType>(),
            Err(DomainError::UnknownResourceType(_))
        ));
    }

    #[test]
    fn state_wire_labels_are_dashed() {
        let json = serde_json::to_string(&ClusterState::ProvisioningInProgress).unwrap();
        assert_eq!(json, "\"provisioning-in-progress\"");
        let json = serde_json::to_string(&InstallationState::WakeUpRequested).unwrap();
        assert_eq!(json, "\"wake-up-requested\"");
        let back: InstallationState = serde_json::from_str("\"creation-dns\"").unwrap();
        assert_eq!(back, InstallationState::CreationDns);
    }

    #[test]
    fn event_payload_uses_millis_webhook_uses_nanos() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let event = StateChangeEvent::new(
            ResourceType::Installation,
            "inst-1",
            "creation-requested",
            "creation-in-progress",
            BTreeMap::new(),
            at,
        );

        let payload = EventPayload::from(&event);
        assert_eq!(payload.timestamp, 1_700_000_000_123);

        let legacy = WebhookPayload::from(&event);
        assert_eq!(legacy.timestamp, 1_700_000_000_123_000_000);

        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("EventID").is_some());
        assert!(json.get("Timestamp").is_some());
        let json = serde_json::to_value(&legacy).unwrap();
        assert_eq!(json.get("Type").unwrap(), "installation");
        assert_eq!(json.get("ID").unwrap(), "inst-1");
    }

    #[test]
    fn multitenant_database_migration_bookkeeping() {
        let now = Utc::now();
        let mut db = MultitenantDatabase::new("rds-cluster-1", now);
        let a = InstallationId::new("a");
        let b = InstallationId::new("b");

        db.add_installation(a.clone(), 2.0);
        db.add_installation(b.clone(), 4.0);
        db.add_installation(a.clone(), 2.0); // duplicate add is a no-op
        assert_eq!(db.weight_sum, 6.0);

        db.mark_migrated_out(&a, 2.0);
        assert_eq!(db.weight_sum, 4.0);
        assert!(!db.hosts(&a));
        assert!(db.holds_migrated(&a));
        assert!(db.hosts(&b));

        // Never simultaneously hosted and migrated.
        assert!(!(db.hosts(&a) && db.holds_migrated(&a)));
    }
}
