use std::time::Duration;

use async_trait::async_trait;
use parlance_domain::{
    Cluster, ClusterId, ClusterInstallation, ClusterInstallationId, EventDelivery,
    EventDeliveryData, EventType, Installation, InstallationBackup, InstallationDbMigration,
    InstallationDbRestoration, InstallationId, MultitenantDatabase, ResourceType,
    StateChangeEvent, Subscription, Webhook,
};
use uuid::Uuid;

use crate::error::StoreError;

/// The storage contract the control plane consumes.
///
/// Every call may fail transiently; supervisors treat all store errors as
/// retriable and re-attempt on their next tick. `…_pending_work` methods
/// return unlocked resources in a non-resting state, oldest activity first.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ── Leases ────────────────────────────────────────────────────────────────

    /// Compare-and-swap lease acquisition. Idempotent for the same locker.
    /// Returns false when the resource is missing or held by someone else.
    async fn lock_resource(
        &self,
        resource_type: ResourceType,
        id: &str,
        locker_id: &str,
    ) -> Result<bool, StoreError>;

    /// Release a lease. Only the holder may release unless `force` is set.
    /// Returns whether the resource is unlocked afterwards.
    async fn unlock_resource(
        &self,
        resource_type: ResourceType,
        id: &str,
        locker_id: &str,
        force: bool,
    ) -> Result<bool, StoreError>;

    // ── Clusters ──────────────────────────────────────────────────────────────

    async fn create_cluster(&self, cluster: &Cluster) -> Result<(), StoreError>;
    async fn get_cluster(&self, id: &ClusterId) -> Result<Option<Cluster>, StoreError>;
    async fn list_clusters(&self) -> Result<Vec<Cluster>, StoreError>;
    async fn update_cluster(&self, cluster: &Cluster) -> Result<(), StoreError>;
    async fn clusters_pending_work(&self) -> Result<Vec<Cluster>, StoreError>;

    // ── Installations ─────────────────────────────────────────────────────────

    async fn create_installation(&self, installation: &Installation) -> Result<(), StoreError>;
    async fn get_installation(
        &self,
        id: &InstallationId,
    ) -> Result<Option<Installation>, StoreError>;
    async fn list_installations(&self) -> Result<Vec<Installation>, StoreError>;
    async fn update_installation(&self, installation: &Installation) -> Result<(), StoreError>;
    async fn installations_pending_work(&self) -> Result<Vec<Installation>, StoreError>;
    /// Look up a live (non-deleted) installation by its DNS name.
    async fn installation_by_dns(&self, dns: &str) -> Result<Option<Installation>, StoreError>;

    // ── Cluster installations ─────────────────────────────────────────────────

    /// Fails with [`StoreError::Conflict`] when a non-deleted binding for the
    /// same (cluster, installation) pair already exists.
    async fn create_cluster_installation(
        &self,
        cluster_installation: &ClusterInstallation,
    ) -> Result<(), StoreError>;
    async fn get_cluster_installation(
        &self,
        id: &ClusterInstallationId,
    ) -> Result<Option<ClusterInstallation>, StoreError>;
    async fn update_cluster_installation(
        &self,
        cluster_installation: &ClusterInstallation,
    ) -> Result<(), StoreError>;
    async fn cluster_installations_pending_work(
        &self,
    ) -> Result<Vec<ClusterInstallation>, StoreError>;
    async fn cluster_installations_for_installation(
        &self,
        installation_id: &InstallationId,
    ) -> Result<Vec<ClusterInstallation>, StoreError>;

    // ── Backups ───────────────────────────────────────────────────────────────

    async fn create_backup(&self, backup: &InstallationBackup) -> Result<(), StoreError>;
    async fn get_backup(&self, id: Uuid) -> Result<Option<InstallationBackup>, StoreError>;
    async fn update_backup(&self, backup: &InstallationBackup) -> Result<(), StoreError>;
    async fn backups_pending_work(&self) -> Result<Vec<InstallationBackup>, StoreError>;
    async fn running_backup_for_installation(
        &self,
        installation_id: &InstallationId,
    ) -> Result<Option<InstallationBackup>, StoreError>;

    // ── Database restorations ─────────────────────────────────────────────────

    async fn create_restoration(
        &self,
        restoration: &InstallationDbRestoration,
    ) -> Result<(), StoreError>;
    async fn get_restoration(
        &self,
        id: Uuid,
    ) -> Result<Option<InstallationDbRestoration>, StoreError>;
    async fn update_restoration(
        &self,
        restoration: &InstallationDbRestoration,
    ) -> Result<(), StoreError>;
    async fn restorations_pending_work(
        &self,
    ) -> Result<Vec<InstallationDbRestoration>, StoreError>;
    async fn unfinished_restoration_for_installation(
        &self,
        installation_id: &InstallationId,
    ) -> Result<Option<InstallationDbRestoration>, StoreError>;

    // ── Database migrations ───────────────────────────────────────────────────

    async fn create_migration(
        &self,
        migration: &InstallationDbMigration,
    ) -> Result<(), StoreError>;
    async fn get_migration(&self, id: Uuid)
        -> Result<Option<InstallationDbMigration>, StoreError>;
    async fn update_migration(
        &self,
        migration: &InstallationDbMigration,
    ) -> Result<(), StoreError>;
    async fn migrations_pending_work(&self) -> Result<Vec<InstallationDbMigration>, StoreError>;
    async fn unfinished_migration_for_installation(
        &self,
        installation_id: &InstallationId,
    ) -> Result<Option<InstallationDbMigration>, StoreError>;

    // ── Multitenant databases ─────────────────────────────────────────────────

    async fn create_multitenant_database(
        &self,
        database: &MultitenantDatabase,
    ) -> Result<(), StoreError>;
    async fn get_multitenant_database(
        &self,
        id: &str,
    ) -> Result<Option<MultitenantDatabase>, StoreError>;
    async fn update_multitenant_database(
        &self,
        database: &MultitenantDatabase,
    ) -> Result<(), StoreError>;
    /// The database currently hosting the installation, if any.
    async fn multitenant_database_for_installation(
        &self,
        installation_id: &InstallationId,
    ) -> Result<Option<MultitenantDatabase>, StoreError>;

    // ── Events & deliveries ───────────────────────────────────────────────────

    /// Persist an event atomically with one not-attempted delivery row per
    /// subscription interested in its event type.
    async fn create_state_change_event(&self, event: &StateChangeEvent)
        -> Result<(), StoreError>;
    async fn get_state_change_event(
        &self,
        id: Uuid,
    ) -> Result<Option<StateChangeEvent>, StoreError>;
    /// The most recent `limit` events, oldest first.
    async fn list_state_change_events(
        &self,
        limit: usize,
    ) -> Result<Vec<StateChangeEvent>, StoreError>;
    /// Pending (not-attempted or retrying) deliveries for a subscription,
    /// joined with their events, oldest event first.
    async fn events_to_process(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<EventDeliveryData>, StoreError>;
    async fn update_event_delivery(&self, delivery: &EventDelivery) -> Result<(), StoreError>;
    async fn deliveries_for_event(&self, event_id: Uuid)
        -> Result<Vec<EventDelivery>, StoreError>;

    // ── Subscriptions ─────────────────────────────────────────────────────────

    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), StoreError>;
    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>, StoreError>;
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;
    /// Atomically claim an unlocked subscription that has first-time
    /// (not-attempted) work and nothing currently retrying.
    async fn claim_up_to_date_subscription(
        &self,
        instance_id: &str,
    ) -> Result<Option<Subscription>, StoreError>;
    /// Atomically claim an unlocked subscription with a retrying delivery
    /// whose last attempt is older than `cooldown`.
    async fn claim_retrying_subscription(
        &self,
        instance_id: &str,
        cooldown: Duration,
    ) -> Result<Option<Subscription>, StoreError>;
    async fn count_subscriptions_for_event(
        &self,
        event_type: EventType,
    ) -> Result<i64, StoreError>;
    async fn update_subscription_delivery_status(
        &self,
        subscription: &Subscription,
    ) -> Result<(), StoreError>;
    async fn unlock_subscription(
        &self,
        id: Uuid,
        locker_id: &str,
        force: bool,
    ) -> Result<bool, StoreError>;

    // ── Webhooks ──────────────────────────────────────────────────────────────

    async fn create_webhook(&self, webhook: &Webhook) -> Result<(), StoreError>;
    /// All non-deleted webhooks.
    async fn webhooks(&self) -> Result<Vec<Webhook>, StoreError>;
    async fn delete_webhook(&self, id: Uuid) -> Result<(), StoreError>;
}
