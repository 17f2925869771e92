use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parlance_domain::{
    Cluster, ClusterInstallation, ClusterInstallationState, Installation, ResourceType,
};
use parlance_events::EventProducer;
use parlance_provisioner::{ClusterInstallationProvisioner, ProvisionerRegistry};
use parlance_store::Store;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::supervisor::{for_each_bounded, record_transition, try_lock, unlock, Supervisor};

/// Reconciles the in-cluster custom resource of each installation binding.
/// A binding leaves `reconciling` only when the operator has observed the
/// current spec generation and reports the resource stable.
#[derive(Clone)]
pub struct ClusterInstallationSupervisor {
    store: Arc<dyn Store>,
    registry: Arc<ProvisionerRegistry>,
    events: Arc<EventProducer>,
    instance_id: String,
    concurrency: usize,
}

impl ClusterInstallationSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ProvisionerRegistry>,
        events: Arc<EventProducer>,
        instance_id: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        ClusterInstallationSupervisor {
            store,
            registry,
            events,
            instance_id: instance_id.into(),
            concurrency: concurrency.max(1),
        }
    }

    async fn supervise(&self, candidate: ClusterInstallation) {
        let id = candidate.id.clone();
        if !try_lock(
            &self.store,
            ResourceType::ClusterInstallation,
            id.as_str(),
            &self.instance_id,
        )
        .await
        {
            return;
        }

        let reloaded = match self.store.get_cluster_installation(&id).await {
            Ok(Some(cluster_installation)) => cluster_installation,
            Ok(None) => {
                unlock(
                    &self.store,
                    ResourceType::ClusterInstallation,
                    id.as_str(),
                    &self.instance_id,
                )
                .await;
                return;
            }
            Err(err) => {
                warn!(
                    cluster_installation_id = %id,
                    error = %err,
                    "failed to reload cluster installation"
                );
                unlock(
                    &self.store,
                    ResourceType::ClusterInstallation,
                    id.as_str(),
                    &self.instance_id,
                )
                .await;
                return;
            }
        };
        if !reloaded.state.pending_work() {
            unlock(
                &self.store,
                ResourceType::ClusterInstallation,
                id.as_str(),
                &self.instance_id,
            )
            .await;
            return;
        }

        let mut cluster_installation = reloaded;
        let old_state = cluster_installation.state;
        self.transition(&mut cluster_installation).await;
        debug!(
            cluster_installation_id = %id,
            old_state = %old_state,
            new_state = %cluster_installation.state,
            "cluster installation supervised"
        );

        match self.store.update_cluster_installation(&cluster_installation).await {
            Err(err) => warn!(
                cluster_installation_id = %id,
                error = %err,
                "failed to persist cluster installation"
            ),
            Ok(()) if cluster_installation.state != old_state => {
                let mut extra = BTreeMap::new();
                extra.insert(
                    "cluster_id".to_string(),
                    cluster_installation.cluster_id.to_string(),
                );
                extra.insert(
                    "installation_id".to_string(),
                    cluster_installation.installation_id.to_string(),
                );
                record_transition(
                    &self.events,
                    ResourceType::ClusterInstallation,
                    id.as_str(),
                    old_state.as_str(),
                    cluster_installation.state.as_str(),
                    extra,
                )
                .await;
            }
            Ok(()) => {}
        }

        unlock(
            &self.store,
            ResourceType::ClusterInstallation,
            id.as_str(),
            &self.instance_id,
        )
        .await;
    }

    async fn transition(&self, cluster_installation: &mut ClusterInstallation) {
        let result = self.step(cluster_installation).await;
        match result {
            Ok(next) => cluster_installation.state = next,
            Err(err) => {
                warn!(
                    cluster_installation_id = %cluster_installation.id,
                    state = %cluster_installation.state,
                    error = %err,
                    "cluster installation transition failed"
                );
                if err.is_permanent() {
                    cluster_installation.state = match cluster_installation.state {
                        ClusterInstallationState::DeletionRequested => {
                            ClusterInstallationState::DeletionFailed
                        }
                        _ => ClusterInstallationState::CreationFailed,
                    };
                }
            }
        }
    }

    async fn step(
        &self,
        cluster_installation: &mut ClusterInstallation,
    ) -> Result<ClusterInstallationState, SupervisorError> {
        let (cluster, installation, provisioner) = self.context(cluster_installation).await?;

        match cluster_installation.state {
            ClusterInstallationState::CreationRequested
            | ClusterInstallationState::CreationFailed => {
                provisioner.create(&cluster, &installation, cluster_installation).await?;
                info!(
                    cluster_installation_id = %cluster_installation.id,
                    namespace = %cluster_installation.namespace,
                    "custom resource created"
                );
                Ok(ClusterInstallationState::Reconciling)
            }
            ClusterInstallationState::Reconciling => {
                provisioner.ensure_cr_migrated(&cluster, cluster_installation).await?;
                let status =
                    provisioner.cluster_resource(&cluster, cluster_installation).await?;
                if !status.reconciled() {
                    debug!(
                        cluster_installation_id = %cluster_installation.id,
                        spec_generation = status.spec_generation,
                        observed_generation = status.observed_generation,
                        reported = %status.state,
                        "custom resource not settled yet"
                    );
                    return Ok(ClusterInstallationState::Reconciling);
                }
                if !provisioner
                    .verify_matches_config(&cluster, &installation, cluster_installation)
                    .await?
                {
                    // Settled on a stale spec; push the current one and keep
                    // reconciling.
                    provisioner.update(&cluster, &installation, cluster_installation).await?;
                    return Ok(ClusterInstallationState::Reconciling);
                }
                Ok(ClusterInstallationState::Stable)
            }
            ClusterInstallationState::DeletionRequested
            | ClusterInstallationState::DeletionFailed => {
                if provisioner.delete(&cluster, cluster_installation).await? {
                    Ok(ClusterInstallationState::Deleted)
                } else {
                    Ok(ClusterInstallationState::DeletionRequested)
                }
            }
            ClusterInstallationState::Stable | ClusterInstallationState::Deleted => {
                Ok(cluster_installation.state)
            }
        }
    }

    async fn context(
        &self,
        cluster_installation: &ClusterInstallation,
    ) -> Result<
        (Cluster, Installation, Arc<dyn ClusterInstallationProvisioner>),
        SupervisorError,
    > {
        let cluster = self
            .store
            .get_cluster(&cluster_installation.cluster_id)
            .await?
            .ok_or_else(|| {
                SupervisorError::Invariant(format!(
                    "cluster {} is gone",
                    cluster_installation.cluster_id
                ))
            })?;
        let installation = self
            .store
            .get_installation(&cluster_installation.installation_id)
            .await?
            .ok_or_else(|| {
                SupervisorError::Invariant(format!(
                    "installation {} is gone",
                    cluster_installation.installation_id
                ))
            })?;
        let provisioner = self.registry.cluster_installation_for(&cluster)?;
        Ok((cluster, installation, provisioner))
    }
}

#[async_trait]
impl Supervisor for ClusterInstallationSupervisor {
    fn name(&self) -> &'static str {
        "cluster_installation"
    }

    async fn do_work(&self) {
        let cluster_installations = match self.store.cluster_installations_pending_work().await {
            Ok(cluster_installations) => cluster_installations,
            Err(err) => {
                warn!(error = %err, "failed to scan cluster installations pending work");
                return;
            }
        };
        let this = self.clone();
        for_each_bounded(cluster_installations, self.concurrency, move |ci| {
            let this = this.clone();
            async move { this.supervise(ci).await }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_cluster, test_env, test_installation};
    use chrono::Utc;

    async fn seeded_binding(
        env: &crate::testutil::TestEnv,
    ) -> parlance_domain::ClusterInstallation {
        let cluster = test_cluster();
        env.store.create_cluster(&cluster).await.unwrap();
        let installation = test_installation("cr.chat.example.com");
        env.store.create_installation(&installation).await.unwrap();
        let binding =
            ClusterInstallation::new(cluster.id.clone(), installation.id.clone(), Utc::now());
        env.store.create_cluster_installation(&binding).await.unwrap();
        binding
    }

    #[tokio::test]
    async fn reconciling_waits_for_observed_generation() {
        // One not-ready poll before the CR settles.
        let env = test_env(1).await;
        let binding = seeded_binding(&env).await;

        let supervisor = ClusterInstallationSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );

        supervisor.do_work().await;
        let stored = env
            .store
            .get_cluster_installation(&binding.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, ClusterInstallationState::Reconciling);

        supervisor.do_work().await;
        let stored = env
            .store
            .get_cluster_installation(&binding.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.state,
            ClusterInstallationState::Reconciling,
            "observed generation still behind"
        );

        supervisor.do_work().await;
        let stored = env
            .store
            .get_cluster_installation(&binding.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, ClusterInstallationState::Stable);
    }

    #[tokio::test]
    async fn missing_cluster_is_transient() {
        let env = test_env(0).await;
        let installation = test_installation("orphan.chat.example.com");
        env.store.create_installation(&installation).await.unwrap();
        let binding = ClusterInstallation::new(
            parlance_domain::ClusterId::new("never-created"),
            installation.id.clone(),
            Utc::now(),
        );
        env.store.create_cluster_installation(&binding).await.unwrap();

        let supervisor = ClusterInstallationSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );
        supervisor.do_work().await;

        let stored = env
            .store
            .get_cluster_installation(&binding.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.state,
            ClusterInstallationState::CreationRequested,
            "stays for the next tick rather than failing"
        );
        assert!(!stored.lease.is_locked());
    }
}
