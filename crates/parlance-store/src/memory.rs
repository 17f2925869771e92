use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parlance_domain::{
    Cluster, ClusterId, ClusterInstallation, ClusterInstallationId, DeliveryStatus, EventDelivery,
    EventDeliveryData, EventType, Installation, InstallationBackup, InstallationDbMigration,
    InstallationDbRestoration, InstallationId, Lease, MultitenantDatabase, ResourceType,
    StateChangeEvent, Subscription, Webhook,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::Store;

#[derive(Debug, Default)]
struct Inner {
    clusters: HashMap<ClusterId, Cluster>,
    installations: HashMap<InstallationId, Installation>,
    cluster_installations: HashMap<ClusterInstallationId, ClusterInstallation>,
    backups: HashMap<Uuid, InstallationBackup>,
    restorations: HashMap<Uuid, InstallationDbRestoration>,
    migrations: HashMap<Uuid, InstallationDbMigration>,
    databases: HashMap<String, MultitenantDatabase>,
    /// Insertion-ordered; order breaks timestamp ties in delivery processing.
    events: Vec<StateChangeEvent>,
    deliveries: HashMap<Uuid, EventDelivery>,
    subscriptions: HashMap<Uuid, Subscription>,
    webhooks: HashMap<Uuid, Webhook>,
}

impl Inner {
    fn lease_of(&mut self, resource_type: ResourceType, id: &str) -> Option<&mut Lease> {
        match resource_type {
            ResourceType::Cluster => self
                .clusters
                .get_mut(&ClusterId::new(id))
                .map(|c| &mut c.lease),
            ResourceType::Installation => self
                .installations
                .get_mut(&InstallationId::new(id))
                .map(|i| &mut i.lease),
            ResourceType::ClusterInstallation => self
                .cluster_installations
                .get_mut(&ClusterInstallationId::new(id))
                .map(|ci| &mut ci.lease),
            ResourceType::InstallationBackup => Uuid::parse_str(id)
                .ok()
                .and_then(|uid| self.backups.get_mut(&uid))
                .map(|b| &mut b.lease),
            ResourceType::InstallationDbRestoration => Uuid::parse_str(id)
                .ok()
                .and_then(|uid| self.restorations.get_mut(&uid))
                .map(|r| &mut r.lease),
            ResourceType::InstallationDbMigration => Uuid::parse_str(id)
                .ok()
                .and_then(|uid| self.migrations.get_mut(&uid))
                .map(|m| &mut m.lease),
        }
    }
}

/// In-memory implementation of [`Store`].
///
/// All data is lost on process exit. Suitable for tests and local mode.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    // ── Leases ────────────────────────────────────────────────────────────────

    async fn lock_resource(
        &self,
        resource_type: ResourceType,
        id: &str,
        locker_id: &str,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let now = Utc::now();
        Ok(guard
            .lease_of(resource_type, id)
            .map(|lease| lease.acquire(locker_id, now))
            .unwrap_or(false))
    }

    async fn unlock_resource(
        &self,
        resource_type: ResourceType,
        id: &str,
        locker_id: &str,
        force: bool,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        Ok(guard
            .lease_of(resource_type, id)
            .map(|lease| lease.release(locker_id, force))
            .unwrap_or(false))
    }

    // ── Clusters ──────────────────────────────────────────────────────────────

    async fn create_cluster(&self, cluster: &Cluster) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(())
    }

    async fn get_cluster(&self, id: &ClusterId) -> Result<Option<Cluster>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.clusters.get(id).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, StoreError> {
        let guard = self.inner.read().await;
        let mut clusters: Vec<Cluster> = guard.clusters.values().cloned().collect();
        clusters.sort_by_key(|c| c.created_at);
        Ok(clusters)
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.clusters.contains_key(&cluster.id) {
            return Err(StoreError::NotFound(format!("cluster {}", cluster.id)));
        }
        let mut updated = cluster.clone();
        updated.updated_at = Utc::now();
        guard.clusters.insert(updated.id.clone(), updated);
        Ok(())
    }

    async fn clusters_pending_work(&self) -> Result<Vec<Cluster>, StoreError> {
        let guard = self.inner.read().await;
        let mut clusters: Vec<Cluster> = guard
            .clusters
            .values()
            .filter(|c| c.state.pending_work() && !c.lease.is_locked())
            .cloned()
            .collect();
        clusters.sort_by_key(|c| c.updated_at);
        Ok(clusters)
    }

    // ── Installations ─────────────────────────────────────────────────────────

    async fn create_installation(&self, installation: &Installation) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let dns_taken = guard
            .installations
            .values()
            .any(|i| i.dns == installation.dns && !i.state.is_deleted());
        if dns_taken {
            return Err(StoreError::Conflict(format!(
                "dns {} already in use",
                installation.dns
            )));
        }
        guard
            .installations
            .insert(installation.id.clone(), installation.clone());
        Ok(())
    }

    async fn get_installation(
        &self,
        id: &InstallationId,
    ) -> Result<Option<Installation>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.installations.get(id).cloned())
    }

    async fn list_installations(&self) -> Result<Vec<Installation>, StoreError> {
        let guard = self.inner.read().await;
        let mut installations: Vec<Installation> =
            guard.installations.values().cloned().collect();
        installations.sort_by_key(|i| i.created_at);
        Ok(installations)
    }

    async fn update_installation(&self, installation: &Installation) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.installations.contains_key(&installation.id) {
            return Err(StoreError::NotFound(format!(
                "installation {}",
                installation.id
            )));
        }
        let mut updated = installation.clone();
        updated.updated_at = Utc::now();
        guard.installations.insert(updated.id.clone(), updated);
        Ok(())
    }

    async fn installations_pending_work(&self) -> Result<Vec<Installation>, StoreError> {
        let guard = self.inner.read().await;
        let mut installations: Vec<Installation> = guard
            .installations
            .values()
            .filter(|i| i.state.pending_work() && !i.lease.is_locked())
            .cloned()
            .collect();
        installations.sort_by_key(|i| i.updated_at);
        Ok(installations)
    }

    async fn installation_by_dns(&self, dns: &str) -> Result<Option<Installation>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .installations
            .values()
            .find(|i| i.dns == dns && !i.state.is_deleted())
            .cloned())
    }

    // ── Cluster installations ─────────────────────────────────────────────────

    async fn create_cluster_installation(
        &self,
        cluster_installation: &ClusterInstallation,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let duplicate = guard.cluster_installations.values().any(|ci| {
            ci.cluster_id == cluster_installation.cluster_id
                && ci.installation_id == cluster_installation.installation_id
                && !ci.state.is_deleted()
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "installation {} already placed on cluster {}",
                cluster_installation.installation_id, cluster_installation.cluster_id
            )));
        }
        guard.cluster_installations.insert(
            cluster_installation.id.clone(),
            cluster_installation.clone(),
        );
        Ok(())
    }

    async fn get_cluster_installation(
        &self,
        id: &ClusterInstallationId,
    ) -> Result<Option<ClusterInstallation>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.cluster_installations.get(id).cloned())
    }

    async fn update_cluster_installation(
        &self,
        cluster_installation: &ClusterInstallation,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard
            .cluster_installations
            .contains_key(&cluster_installation.id)
        {
            return Err(StoreError::NotFound(format!(
                "cluster installation {}",
                cluster_installation.id
            )));
        }
        let mut updated = cluster_installation.clone();
        updated.updated_at = Utc::now();
        guard.cluster_installations.insert(updated.id.clone(), updated);
        Ok(())
    }

    async fn cluster_installations_pending_work(
        &self,
    ) -> Result<Vec<ClusterInstallation>, StoreError> {
        let guard = self.inner.read().await;
        let mut cluster_installations: Vec<ClusterInstallation> = guard
            .cluster_installations
            .values()
            .filter(|ci| ci.state.pending_work() && !ci.lease.is_locked())
            .cloned()
            .collect();
        cluster_installations.sort_by_key(|ci| ci.updated_at);
        Ok(cluster_installations)
    }

    async fn cluster_installations_for_installation(
        &self,
        installation_id: &InstallationId,
    ) -> Result<Vec<ClusterInstallation>, StoreError> {
        let guard = self.inner.read().await;
        let mut cluster_installations: Vec<ClusterInstallation> = guard
            .cluster_installations
            .values()
            .filter(|ci| &ci.installation_id == installation_id && !ci.state.is_deleted())
            .cloned()
            .collect();
        cluster_installations.sort_by_key(|ci| ci.created_at);
        Ok(cluster_installations)
    }

    // ── Backups ───────────────────────────────────────────────────────────────

    async fn create_backup(&self, backup: &InstallationBackup) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.backups.insert(backup.id, backup.clone());
        Ok(())
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<InstallationBackup>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.backups.get(&id).cloned())
    }

    async fn update_backup(&self, backup: &InstallationBackup) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.backups.contains_key(&backup.id) {
            return Err(StoreError::NotFound(format!("backup {}", backup.id)));
        }
        let mut updated = backup.clone();
        updated.updated_at = Utc::now();
        guard.backups.insert(updated.id, updated);
        Ok(())
    }

    async fn backups_pending_work(&self) -> Result<Vec<InstallationBackup>, StoreError> {
        let guard = self.inner.read().await;
        let mut backups: Vec<InstallationBackup> = guard
            .backups
            .values()
            .filter(|b| b.state.pending_work() && !b.lease.is_locked())
            .cloned()
            .collect();
        backups.sort_by_key(|b| b.updated_at);
        Ok(backups)
    }

    async fn running_backup_for_installation(
        &self,
        installation_id: &InstallationId,
    ) -> Result<Option<InstallationBackup>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .backups
            .values()
            .find(|b| &b.installation_id == installation_id && b.state.is_running())
            .cloned())
    }

    // ── Database restorations ─────────────────────────────────────────────────

    async fn create_restoration(
        &self,
        restoration: &InstallationDbRestoration,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.restorations.insert(restoration.id, restoration.clone());
        Ok(())
    }

    async fn get_restoration(
        &self,
        id: Uuid,
    ) -> Result<Option<InstallationDbRestoration>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.restorations.get(&id).cloned())
    }

    async fn update_restoration(
        &self,
        restoration: &InstallationDbRestoration,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.restorations.contains_key(&restoration.id) {
            return Err(StoreError::NotFound(format!("restoration {}", restoration.id)));
        }
        let mut updated = restoration.clone();
        updated.updated_at = Utc::now();
        guard.restorations.insert(updated.id, updated);
        Ok(())
    }

    async fn restorations_pending_work(
        &self,
    ) -> Result<Vec<InstallationDbRestoration>, StoreError> {
        let guard = self.inner.read().await;
        let mut restorations: Vec<InstallationDbRestoration> = guard
            .restorations
            .values()
            .filter(|r| r.state.pending_work() && !r.lease.is_locked())
            .cloned()
            .collect();
        restorations.sort_by_key(|r| r.updated_at);
        Ok(restorations)
    }

    async fn unfinished_restoration_for_installation(
        &self,
        installation_id: &InstallationId,
    ) -> Result<Option<InstallationDbRestoration>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .restorations
            .values()
            .find(|r| &r.installation_id == installation_id && r.state.pending_work())
            .cloned())
    }

    // ── Database migrations ───────────────────────────────────────────────────

    async fn create_migration(
        &self,
        migration: &InstallationDbMigration,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.migrations.insert(migration.id, migration.clone());
        Ok(())
    }

    async fn get_migration(
        &self,
        id: Uuid,
    ) -> Result<Option<InstallationDbMigration>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.migrations.get(&id).cloned())
    }

    async fn update_migration(
        &self,
        migration: &InstallationDbMigration,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.migrations.contains_key(&migration.id) {
            return Err(StoreError::NotFound(format!("migration {}", migration.id)));
        }
        let mut updated = migration.clone();
        updated.updated_at = Utc::now();
        guard.migrations.insert(updated.id, updated);
        Ok(())
    }

    async fn migrations_pending_work(&self) -> Result<Vec<InstallationDbMigration>, StoreError> {
        let guard = self.inner.read().await;
        let mut migrations: Vec<InstallationDbMigration> = guard
            .migrations
            .values()
            .filter(|m| m.state.pending_work() && !m.lease.is_locked())
            .cloned()
            .collect();
        migrations.sort_by_key(|m| m.updated_at);
        Ok(migrations)
    }

    async fn unfinished_migration_for_installation(
        &self,
        installation_id: &InstallationId,
    ) -> Result<Option<InstallationDbMigration>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .migrations
            .values()
            .find(|m| &m.installation_id == installation_id && m.state.pending_work())
            .cloned())
    }

    // ── Multitenant databases ─────────────────────────────────────────────────

    async fn create_multitenant_database(
        &self,
        database: &MultitenantDatabase,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.databases.insert(database.id.clone(), database.clone());
        Ok(())
    }

    async fn get_multitenant_database(
        &self,
        id: &str,
    ) -> Result<Option<MultitenantDatabase>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.databases.get(id).cloned())
    }

    async fn update_multitenant_database(
        &self,
        database: &MultitenantDatabase,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.databases.contains_key(&database.id) {
            return Err(StoreError::NotFound(format!("database {}", database.id)));
        }
        let mut updated = database.clone();
        updated.updated_at = Utc::now();
        guard.databases.insert(updated.id.clone(), updated);
        Ok(())
    }

    async fn multitenant_database_for_installation(
        &self,
        installation_id: &InstallationId,
    ) -> Result<Option<MultitenantDatabase>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .databases
            .values()
            .find(|db| db.hosts(installation_id))
            .cloned())
    }

    // ── Events & deliveries ───────────────────────────────────────────────────

    async fn create_state_change_event(
        &self,
        event: &StateChangeEvent,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let interested: Vec<Uuid> = guard
            .subscriptions
            .values()
            .filter(|s| s.event_type == event.event_type)
            .map(|s| s.id)
            .collect();
        guard.events.push(event.clone());
        for subscription_id in interested {
            let delivery = EventDelivery::new(event.id, subscription_id);
            guard.deliveries.insert(delivery.id, delivery);
        }
        Ok(())
    }

    async fn get_state_change_event(
        &self,
        id: Uuid,
    ) -> Result<Option<StateChangeEvent>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.events.iter().find(|e| e.id == id).cloned())
    }

    async fn list_state_change_events(
        &self,
        limit: usize,
    ) -> Result<Vec<StateChangeEvent>, StoreError> {
        let guard = self.inner.read().await;
        let start = guard.events.len().saturating_sub(limit);
        Ok(guard.events[start..].to_vec())
    }

    async fn events_to_process(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<EventDeliveryData>, StoreError> {
        let guard = self.inner.read().await;
        let mut pending: Vec<EventDeliveryData> = guard
            .events
            .iter()
            .filter_map(|event| {
                let delivery = guard
                    .deliveries
                    .values()
                    .find(|d| d.event_id == event.id && d.subscription_id == subscription_id)?;
                delivery.status.pending().then(|| EventDeliveryData {
                    event: event.clone(),
                    delivery: delivery.clone(),
                })
            })
            .collect();
        // Stable sort: insertion order breaks timestamp ties.
        pending.sort_by_key(|dd| dd.event.timestamp);
        Ok(pending)
    }

    async fn update_event_delivery(&self, delivery: &EventDelivery) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.deliveries.contains_key(&delivery.id) {
            return Err(StoreError::NotFound(format!("delivery {}", delivery.id)));
        }
        guard.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn deliveries_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<EventDelivery>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .deliveries
            .values()
            .filter(|d| d.event_id == event_id)
            .cloned()
            .collect())
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.subscriptions.get(&id).cloned())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let guard = self.inner.read().await;
        let mut subscriptions: Vec<Subscription> =
            guard.subscriptions.values().cloned().collect();
        subscriptions.sort_by_key(|s| s.created_at);
        Ok(subscriptions)
    }

    async fn claim_up_to_date_subscription(
        &self,
        instance_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let mut guard = self.inner.write().await;
        let now = Utc::now();
        let candidate = {
            let guard = &*guard;
            let mut candidates: Vec<&Subscription> = guard
                .subscriptions
                .values()
                .filter(|s| !s.lease.is_locked())
                .filter(|s| {
                    let mut has_fresh = false;
                    for d in guard.deliveries.values() {
                        if d.subscription_id != s.id {
                            continue;
                        }
                        match d.status {
                            DeliveryStatus::Retrying => return false,
                            DeliveryStatus::NotAttempted => has_fresh = true,
                            _ => {}
                        }
                    }
                    has_fresh
                })
                .collect();
            candidates.sort_by_key(|s| s.created_at);
            candidates.first().map(|s| s.id)
        };
        let Some(id) = candidate else { return Ok(None) };
        let Some(subscription) = guard.subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        subscription.lease.acquire(instance_id, now);
        Ok(Some(subscription.clone()))
    }

    async fn claim_retrying_subscription(
        &self,
        instance_id: &str,
        cooldown: Duration,
    ) -> Result<Option<Subscription>, StoreError> {
        let mut guard = self.inner.write().await;
        let now = Utc::now();
        let cooldown = chrono::Duration::from_std(cooldown)
            .map_err(|e| StoreError::Internal(format!("cooldown out of range: {e}")))?;
        let cutoff = now - cooldown;
        let candidate = {
            let guard = &*guard;
            let mut candidates: Vec<&Subscription> = guard
                .subscriptions
                .values()
                .filter(|s| !s.lease.is_locked())
                .filter(|s| {
                    guard.deliveries.values().any(|d| {
                        d.subscription_id == s.id
                            && d.status == DeliveryStatus::Retrying
                            && d.last_attempt.map(|at| at <= cutoff).unwrap_or(true)
                    })
                })
                .collect();
            candidates.sort_by_key(|s| s.created_at);
            candidates.first().map(|s| s.id)
        };
        let Some(id) = candidate else { return Ok(None) };
        let Some(subscription) = guard.subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        subscription.lease.acquire(instance_id, now);
        Ok(Some(subscription.clone()))
    }

    async fn count_subscriptions_for_event(
        &self,
        event_type: EventType,
    ) -> Result<i64, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .subscriptions
            .values()
            .filter(|s| s.event_type == event_type)
            .count() as i64)
    }

    async fn update_subscription_delivery_status(
        &self,
        subscription: &Subscription,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::NotFound(format!(
                "subscription {}",
                subscription.id
            )));
        }
        guard
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn unlock_subscription(
        &self,
        id: Uuid,
        locker_id: &str,
        force: bool,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        Ok(guard
            .subscriptions
            .get_mut(&id)
            .map(|s| s.lease.release(locker_id, force))
            .unwrap_or(false))
    }

    // ── Webhooks ──────────────────────────────────────────────────────────────

    async fn create_webhook(&self, webhook: &Webhook) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.webhooks.insert(webhook.id, webhook.clone());
        Ok(())
    }

    async fn webhooks(&self) -> Result<Vec<Webhook>, StoreError> {
        let guard = self.inner.read().await;
        let mut webhooks: Vec<Webhook> = guard
            .webhooks
            .values()
            .filter(|w| !w.is_deleted())
            .cloned()
            .collect();
        webhooks.sort_by_key(|w| w.created_at);
        Ok(webhooks)
    }

    async fn delete_webhook(&self, id: Uuid) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let webhook = guard
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("webhook {id}")))?;
        webhook.deleted_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use parlance_domain::{
        ClusterState, EksMetadata, EventType, ProvisionerMetadata, ResourceType,
    };
    use std::collections::BTreeMap;

    fn dummy_cluster() -> Cluster {
        Cluster::new(
            ProvisionerMetadata::Eks(EksMetadata {
                cluster_name: "test".into(),
                version: "1.29".into(),
                node_role_arn: None,
                node_instance_type: "m5.large".into(),
                node_min_count: 2,
                node_max_count: 4,
            }),
            Utc::now(),
        )
    }

    fn dummy_installation(dns: &str) -> Installation {
        Installation::new(
            dns,
            parlance_domain::InstallationSize::Users100,
            "chat/server",
            "9.5.0",
            parlance_domain::DatabaseKind::MultitenantRds,
            parlance_domain::FilestoreKind::MultitenantS3,
            Utc::now(),
        )
        .unwrap()
    }

    fn dummy_subscription(url: &str) -> Subscription {
        Subscription::new(
            url,
            EventType::ResourceStateChange,
            "owner",
            ChronoDuration::minutes(5),
            Utc::now(),
        )
    }

    fn dummy_event() -> StateChangeEvent {
        StateChangeEvent::new(
            ResourceType::Cluster,
            "cluster-1",
            "creating",
            "created",
            BTreeMap::new(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn lock_is_compare_and_swap() {
        let store = InMemoryStore::new();
        let cluster = dummy_cluster();
        store.create_cluster(&cluster).await.unwrap();
        let id = cluster.id.as_str();

        assert!(store
            .lock_resource(ResourceType::Cluster, id, "worker-a")
            .await
            .unwrap());
        // Idempotent for the holder.
        assert!(store
            .lock_resource(ResourceType::Cluster, id, "worker-a")
            .await
            .unwrap());
        // Rejected for everyone else.
        assert!(!store
            .lock_resource(ResourceType::Cluster, id, "worker-b")
            .await
            .unwrap());
        // Wrong holder cannot release without force.
        assert!(!store
            .unlock_resource(ResourceType::Cluster, id, "worker-b", false)
            .await
            .unwrap());
        assert!(store
            .unlock_resource(ResourceType::Cluster, id, "worker-b", true)
            .await
            .unwrap());
        assert!(store
            .lock_resource(ResourceType::Cluster, id, "worker-b")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn lock_missing_resource_is_not_acquired() {
        let store = InMemoryStore::new();
        assert!(!store
            .lock_resource(ResourceType::Cluster, "nope", "worker-a")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn pending_work_skips_locked_and_resting() {
        let store = InMemoryStore::new();
        let mut stable = dummy_cluster();
        stable.state = ClusterState::Stable;
        store.create_cluster(&stable).await.unwrap();

        let pending = dummy_cluster();
        store.create_cluster(&pending).await.unwrap();

        let locked = dummy_cluster();
        store.create_cluster(&locked).await.unwrap();
        store
            .lock_resource(ResourceType::Cluster, locked.id.as_str(), "worker-a")
            .await
            .unwrap();

        let work = store.clusters_pending_work().await.unwrap();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].id, pending.id);
    }

    #[tokio::test]
    async fn dns_must_be_unique_among_live_installations() {
        let store = InMemoryStore::new();
        store
            .create_installation(&dummy_installation("a.chat.example.com"))
            .await
            .unwrap();
        let err = store
            .create_installation(&dummy_installation("a.chat.example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // A deleted installation frees its DNS.
        let mut gone = dummy_installation("b.chat.example.com");
        gone.state = parlance_domain::InstallationState::Deleted;
        store.create_installation(&gone).await.unwrap();
        store
            .create_installation(&dummy_installation("b.chat.example.com"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cluster_installation_pair_is_unique_while_live() {
        let store = InMemoryStore::new();
        let cluster = dummy_cluster();
        let installation = dummy_installation("c.chat.example.com");
        let ci = ClusterInstallation::new(cluster.id.clone(), installation.id.clone(), Utc::now());
        store.create_cluster_installation(&ci).await.unwrap();

        let dup =
            ClusterInstallation::new(cluster.id.clone(), installation.id.clone(), Utc::now());
        let err = store.create_cluster_installation(&dup).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn event_creation_writes_one_delivery_per_interested_subscription() {
        let store = InMemoryStore::new();
        for i in 0..3 {
            store
                .create_subscription(&dummy_subscription(&format!("http://sub-{i}")))
                .await
                .unwrap();
        }
        let event = dummy_event();
        store.create_state_change_event(&event).await.unwrap();

        let deliveries = store.deliveries_for_event(event.id).await.unwrap();
        assert_eq!(deliveries.len(), 3);
        let mut subscription_ids: Vec<Uuid> =
            deliveries.iter().map(|d| d.subscription_id).collect();
        subscription_ids.sort();
        subscription_ids.dedup();
        assert_eq!(subscription_ids.len(), 3, "exactly one row per subscription");
        assert!(deliveries
            .iter()
            .all(|d| d.status == DeliveryStatus::NotAttempted && d.attempts == 0));
    }

    #[tokio::test]
    async fn up_to_date_claim_locks_the_subscription() {
        let store = InMemoryStore::new();
        let sub = dummy_subscription("http://sub");
        store.create_subscription(&sub).await.unwrap();
        store
            .create_state_change_event(&dummy_event())
            .await
            .unwrap();

        let claimed = store
            .claim_up_to_date_subscription("instance-1")
            .await
            .unwrap()
            .expect("claimable");
        assert_eq!(claimed.id, sub.id);
        assert!(claimed.lease.is_held_by("instance-1"));

        // Locked: nobody else can claim it.
        assert!(store
            .claim_up_to_date_subscription("instance-2")
            .await
            .unwrap()
            .is_none());

        assert!(store
            .unlock_subscription(sub.id, "instance-1", false)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn subscription_with_retrying_work_is_not_up_to_date() {
        let store = InMemoryStore::new();
        let sub = dummy_subscription("http://sub");
        store.create_subscription(&sub).await.unwrap();
        let event = dummy_event();
        store.create_state_change_event(&event).await.unwrap();

        let mut delivery = store.deliveries_for_event(event.id).await.unwrap().remove(0);
        delivery.status = DeliveryStatus::Retrying;
        delivery.last_attempt = Some(Utc::now());
        store.update_event_delivery(&delivery).await.unwrap();

        assert!(store
            .claim_up_to_date_subscription("instance-1")
            .await
            .unwrap()
            .is_none());

        // Not claimable for retry inside the cooldown window…
        assert!(store
            .claim_retrying_subscription("instance-1", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
        // …but claimable once the cooldown has passed.
        let claimed = store
            .claim_retrying_subscription("instance-1", Duration::from_millis(0))
            .await
            .unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn events_to_process_is_oldest_first() {
        let store = InMemoryStore::new();
        let sub = dummy_subscription("http://sub");
        store.create_subscription(&sub).await.unwrap();

        let old = StateChangeEvent::new(
            ResourceType::Cluster,
            "c1",
            "creating",
            "created",
            BTreeMap::new(),
            Utc::now() - ChronoDuration::seconds(30),
        );
        let new = dummy_event();
        // Insert newest first to prove ordering comes from timestamps.
        store.create_state_change_event(&new).await.unwrap();
        store.create_state_change_event(&old).await.unwrap();

        let pending = store.events_to_process(sub.id).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].event.id, old.id);
        assert_eq!(pending[1].event.id, new.id);
    }

    #[tokio::test]
    async fn running_backup_lookup() {
        let store = InMemoryStore::new();
        let installation = dummy_installation("d.chat.example.com");
        let backup = InstallationBackup::new(installation.id.clone(), Utc::now());
        store.create_backup(&backup).await.unwrap();

        assert!(store
            .running_backup_for_installation(&installation.id)
            .await
            .unwrap()
            .is_some());

        let mut done = backup.clone();
        done.state = parlance_domain::BackupState::BackupSucceeded;
        store.update_backup(&done).await.unwrap();
        assert!(store
            .running_backup_for_installation(&installation.id)
            .await
            .unwrap()
            .is_none());
    }
}
