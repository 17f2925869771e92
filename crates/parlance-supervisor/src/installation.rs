use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parlance_domain::{
    ClusterInstallation, ClusterInstallationState, ClusterState, Installation,
    InstallationState, ResourceType,
};
use parlance_events::EventProducer;
use parlance_provisioner::ProvisionerRegistry;
use parlance_store::{Store, StoreError};
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::supervisor::{for_each_bounded, record_transition, try_lock, unlock, Supervisor};

/// What to push onto every cluster installation of an installation.
#[derive(Debug, Clone, Copy)]
enum CiOp {
    Update,
    Hibernate,
    WakeUp,
    Delete,
}

/// Schedules installations onto clusters and drives their lifecycle:
/// creation, updates, hibernation, wake-up, deletion. The db-* parked states
/// belong to the restoration/migration supervisors and are never scanned
/// here.
#[derive(Clone)]
pub struct InstallationSupervisor {
    store: Arc<dyn Store>,
    registry: Arc<ProvisionerRegistry>,
    events: Arc<EventProducer>,
    instance_id: String,
    concurrency: usize,
}

impl InstallationSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ProvisionerRegistry>,
        events: Arc<EventProducer>,
        instance_id: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        InstallationSupervisor {
            store,
            registry,
            events,
            instance_id: instance_id.into(),
            concurrency: concurrency.max(1),
        }
    }

    async fn supervise(&self, candidate: Installation) {
        let id = candidate.id.clone();
        if !try_lock(&self.store, ResourceType::Installation, id.as_str(), &self.instance_id)
            .await
        {
            return;
        }

        let reloaded = match self.store.get_installation(&id).await {
            Ok(Some(installation)) => installation,
            Ok(None) => {
                unlock(&self.store, ResourceType::Installation, id.as_str(), &self.instance_id)
                    .await;
                return;
            }
            Err(err) => {
                warn!(installation_id = %id, error = %err, "failed to reload installation");
                unlock(&self.store, ResourceType::Installation, id.as_str(), &self.instance_id)
                    .await;
                return;
            }
        };
        if !reloaded.state.pending_work() {
            unlock(&self.store, ResourceType::Installation, id.as_str(), &self.instance_id)
                .await;
            return;
        }

        let mut installation = reloaded;
        let old_state = installation.state;
        self.transition(&mut installation).await;
        debug!(
            installation_id = %id,
            old_state = %old_state,
            new_state = %installation.state,
            "installation supervised"
        );

        match self.store.update_installation(&installation).await {
            Err(err) => {
                warn!(installation_id = %id, error = %err, "failed to persist installation")
            }
            Ok(()) if installation.state != old_state => {
                let mut extra = BTreeMap::new();
                extra.insert("dns".to_string(), installation.dns.clone());
                record_transition(
                    &self.events,
                    ResourceType::Installation,
                    id.as_str(),
                    old_state.as_str(),
                    installation.state.as_str(),
                    extra,
                )
                .await;
            }
            Ok(()) => {}
        }

        unlock(&self.store, ResourceType::Installation, id.as_str(), &self.instance_id).await;
    }

    async fn transition(&self, installation: &mut Installation) {
        let result = match installation.state {
            InstallationState::CreationRequested | InstallationState::CreationFailed => {
                self.schedule(installation).await
            }
            InstallationState::CreationInProgress => self.check_creation(installation).await,
            InstallationState::CreationDns => self.finalize_dns(installation).await,
            InstallationState::UpdateRequested | InstallationState::UpdateFailed => self
                .push_to_cluster_installations(
                    installation,
                    CiOp::Update,
                    InstallationState::UpdateInProgress,
                )
                .await,
            InstallationState::WakeUpRequested => self
                .push_to_cluster_installations(
                    installation,
                    CiOp::WakeUp,
                    InstallationState::UpdateInProgress,
                )
                .await,
            InstallationState::UpdateInProgress => {
                self.await_settled(installation, InstallationState::Stable).await
            }
            InstallationState::HibernationRequested => self
                .push_to_cluster_installations(
                    installation,
                    CiOp::Hibernate,
                    InstallationState::HibernationInProgress,
                )
                .await,
            InstallationState::HibernationInProgress => {
                self.await_settled(installation, InstallationState::Hibernating).await
            }
            InstallationState::DeletionPendingRequested => self
                .push_to_cluster_installations(
                    installation,
                    CiOp::Hibernate,
                    InstallationState::DeletionPending,
                )
                .await,
            InstallationState::DeletionRequested | InstallationState::DeletionFailed => self
                .push_to_cluster_installations(
                    installation,
                    CiOp::Delete,
                    InstallationState::DeletionInProgress,
                )
                .await,
            InstallationState::DeletionInProgress => self.check_deletion(installation).await,
            InstallationState::DeletionFinalCleanup => self.final_cleanup(installation).await,
            _ => Ok(installation.state),
        };

        match result {
            Ok(next) => installation.state = next,
            Err(err) => {
                warn!(
                    installation_id = %installation.id,
                    state = %installation.state,
                    error = %err,
                    "installation transition failed"
                );
                installation.record_warning(err.to_string(), Utc::now());
                if err.is_permanent() {
                    if let Some(failed) = failed_state_for(installation.state) {
                        installation.state = failed;
                    }
                }
            }
        }
    }

    /// Pick a stable cluster that accepts installations and bind to it.
    async fn schedule(
        &self,
        installation: &mut Installation,
    ) -> Result<InstallationState, SupervisorError> {
        let existing = self
            .store
            .cluster_installations_for_installation(&installation.id)
            .await?;
        if !existing.is_empty() {
            // A previous tick got as far as creating the binding.
            return Ok(InstallationState::CreationInProgress);
        }

        let clusters = self.store.list_clusters().await?;
        let target = clusters
            .into_iter()
            .find(|c| c.state == ClusterState::Stable && c.allow_installations);
        let Some(cluster) = target else {
            return Err(SupervisorError::Invariant(
                "no stable cluster accepts installations".to_string(),
            ));
        };

        let cluster_installation =
            ClusterInstallation::new(cluster.id.clone(), installation.id.clone(), Utc::now());
        match self.store.create_cluster_installation(&cluster_installation).await {
            Ok(()) => {}
            // Lost a race against ourselves; the binding exists.
            Err(StoreError::Conflict(_)) => {}
            Err(err) => return Err(err.into()),
        }
        info!(
            installation_id = %installation.id,
            cluster_id = %cluster.id,
            "installation scheduled onto cluster"
        );
        Ok(InstallationState::CreationInProgress)
    }

    async fn check_creation(
        &self,
        installation: &Installation,
    ) -> Result<InstallationState, SupervisorError> {
        let cluster_installations = self
            .store
            .cluster_installations_for_installation(&installation.id)
            .await?;
        if cluster_installations.is_empty() {
            // Binding vanished underneath us; go back and reschedule.
            return Ok(InstallationState::CreationRequested);
        }
        if cluster_installations
            .iter()
            .all(|ci| ci.state == ClusterInstallationState::Stable)
        {
            Ok(InstallationState::CreationDns)
        } else {
            Ok(InstallationState::CreationInProgress)
        }
    }

    async fn finalize_dns(
        &self,
        installation: &Installation,
    ) -> Result<InstallationState, SupervisorError> {
        // Record creation happens in the DNS collaborator; by this state the
        // workloads are up, so the name can go live.
        info!(
            installation_id = %installation.id,
            dns = %installation.dns,
            "installation dns ensured, installation is stable"
        );
        Ok(InstallationState::Stable)
    }

    /// Apply `op` to every cluster installation, flip them to their
    /// in-progress state, and park the installation in `next` to await
    /// settlement.
    async fn push_to_cluster_installations(
        &self,
        installation: &Installation,
        op: CiOp,
        next: InstallationState,
    ) -> Result<InstallationState, SupervisorError> {
        let cluster_installations = self
            .store
            .cluster_installations_for_installation(&installation.id)
            .await?;

        for mut cluster_installation in cluster_installations {
            let ci_id = cluster_installation.id.clone();
            if !try_lock(
                &self.store,
                ResourceType::ClusterInstallation,
                ci_id.as_str(),
                &self.instance_id,
            )
            .await
            {
                return Err(SupervisorError::Invariant(format!(
                    "cluster installation {ci_id} is busy"
                )));
            }

            let result = self.apply_ci_op(installation, &mut cluster_installation, op).await;
            unlock(
                &self.store,
                ResourceType::ClusterInstallation,
                ci_id.as_str(),
                &self.instance_id,
            )
            .await;
            result?;
        }
        Ok(next)
    }

    async fn apply_ci_op(
        &self,
        installation: &Installation,
        cluster_installation: &mut ClusterInstallation,
        op: CiOp,
    ) -> Result<(), SupervisorError> {
        let cluster = self
            .store
            .get_cluster(&cluster_installation.cluster_id)
            .await?
            .ok_or_else(|| {
                SupervisorError::Invariant(format!(
                    "cluster {} referenced by cluster installation {} is gone",
                    cluster_installation.cluster_id, cluster_installation.id
                ))
            })?;
        let provisioner = self.registry.cluster_installation_for(&cluster)?;

        match op {
            CiOp::Update => {
                provisioner.update(&cluster, installation, cluster_installation).await?;
                cluster_installation.state = ClusterInstallationState::Reconciling;
            }
            CiOp::Hibernate => {
                provisioner.hibernate(&cluster, installation, cluster_installation).await?;
                cluster_installation.state = ClusterInstallationState::Reconciling;
            }
            CiOp::WakeUp => {
                provisioner.update(&cluster, installation, cluster_installation).await?;
                provisioner
                    .refresh_secrets(&cluster, installation, cluster_installation)
                    .await?;
                cluster_installation.state = ClusterInstallationState::Reconciling;
            }
            CiOp::Delete => {
                cluster_installation.state = ClusterInstallationState::DeletionRequested;
            }
        }
        self.store.update_cluster_installation(cluster_installation).await?;
        Ok(())
    }

    async fn await_settled(
        &self,
        installation: &Installation,
        settled: InstallationState,
    ) -> Result<InstallationState, SupervisorError> {
        let cluster_installations = self
            .store
            .cluster_installations_for_installation(&installation.id)
            .await?;
        if cluster_installations
            .iter()
            .all(|ci| ci.state == ClusterInstallationState::Stable)
        {
            Ok(settled)
        } else {
            Ok(installation.state)
        }
    }

    async fn check_deletion(
        &self,
        installation: &Installation,
    ) -> Result<InstallationState, SupervisorError> {
        let remaining = self
            .store
            .cluster_installations_for_installation(&installation.id)
            .await?;
        if remaining.is_empty() {
            Ok(InstallationState::DeletionFinalCleanup)
        } else {
            Ok(InstallationState::DeletionInProgress)
        }
    }

    async fn final_cleanup(
        &self,
        installation: &Installation,
    ) -> Result<InstallationState, SupervisorError> {
        info!(
            installation_id = %installation.id,
            dns = %installation.dns,
            "installation resources released"
        );
        Ok(InstallationState::Deleted)
    }
}

fn failed_state_for(state: InstallationState) -> Option<InstallationState> {
    match state {
        InstallationState::CreationRequested
        | InstallationState::CreationInProgress
        | InstallationState::CreationDns => Some(InstallationState::CreationFailed),
        InstallationState::UpdateRequested
        | InstallationState::UpdateInProgress
        | InstallationState::WakeUpRequested => Some(InstallationState::UpdateFailed),
        InstallationState::DeletionRequested
        | InstallationState::DeletionInProgress
        | InstallationState::DeletionFinalCleanup => Some(InstallationState::DeletionFailed),
        _ => None,
    }
}

#[async_trait]
impl Supervisor for InstallationSupervisor {
    fn name(&self) -> &'static str {
        "installation"
    }

    async fn do_work(&self) {
        let installations = match self.store.installations_pending_work().await {
            Ok(installations) => installations,
            Err(err) => {
                warn!(error = %err, "failed to scan installations pending work");
                return;
            }
        };
        let this = self.clone();
        for_each_bounded(installations, self.concurrency, move |installation| {
            let this = this.clone();
            async move { this.supervise(installation).await }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_installation::ClusterInstallationSupervisor;
    use crate::testutil::{drive_all, test_cluster, test_env, test_installation};

    async fn stable_cluster(env: &crate::testutil::TestEnv) -> parlance_domain::Cluster {
        let mut cluster = test_cluster();
        cluster.state = ClusterState::Stable;
        env.store.create_cluster(&cluster).await.unwrap();
        cluster
    }

    #[tokio::test]
    async fn installation_is_scheduled_and_reaches_stable() {
        let env = test_env(0).await;
        let cluster = stable_cluster(&env).await;
        let installation = test_installation("team.chat.example.com");
        env.store.create_installation(&installation).await.unwrap();

        let installations = InstallationSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            2,
        );
        let cluster_installations = ClusterInstallationSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );

        drive_all(&[&installations as &dyn Supervisor, &cluster_installations], || async {
            env.store
                .get_installation(&installation.id)
                .await
                .unwrap()
                .unwrap()
                .state
                == InstallationState::Stable
        })
        .await;

        let bindings = env
            .store
            .cluster_installations_for_installation(&installation.id)
            .await
            .unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].cluster_id, cluster.id);
        assert_eq!(bindings[0].state, ClusterInstallationState::Stable);
        assert_eq!(bindings[0].namespace, installation.id.as_str());

        let events = env.store.list_state_change_events(100).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.resource_type == ResourceType::Installation && e.new_state == "stable"));
    }

    #[tokio::test]
    async fn no_available_cluster_leaves_a_warning() {
        let env = test_env(0).await;
        let installation = test_installation("waiting.chat.example.com");
        env.store.create_installation(&installation).await.unwrap();

        let supervisor = InstallationSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );
        supervisor.do_work().await;

        let stored = env
            .store
            .get_installation(&installation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, InstallationState::CreationRequested);
        assert!(stored.last_warning.is_some());
    }

    #[tokio::test]
    async fn hibernate_then_wake_up() {
        let env = test_env(0).await;
        stable_cluster(&env).await;
        let installation = test_installation("sleepy.chat.example.com");
        env.store.create_installation(&installation).await.unwrap();

        let installations = InstallationSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );
        let cluster_installations = ClusterInstallationSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );

        drive_all(&[&installations as &dyn Supervisor, &cluster_installations], || async {
            env.store
                .get_installation(&installation.id)
                .await
                .unwrap()
                .unwrap()
                .state
                == InstallationState::Stable
        })
        .await;

        let mut stored = env
            .store
            .get_installation(&installation.id)
            .await
            .unwrap()
            .unwrap();
        stored.state = InstallationState::HibernationRequested;
        env.store.update_installation(&stored).await.unwrap();

        drive_all(&[&installations as &dyn Supervisor, &cluster_installations], || async {
            env.store
                .get_installation(&installation.id)
                .await
                .unwrap()
                .unwrap()
                .state
                == InstallationState::Hibernating
        })
        .await;

        let mut stored = env
            .store
            .get_installation(&installation.id)
            .await
            .unwrap()
            .unwrap();
        stored.state = InstallationState::WakeUpRequested;
        env.store.update_installation(&stored).await.unwrap();

        drive_all(&[&installations as &dyn Supervisor, &cluster_installations], || async {
            env.store
                .get_installation(&installation.id)
                .await
                .unwrap()
                .unwrap()
                .state
                == InstallationState::Stable
        })
        .await;
    }

    #[tokio::test]
    async fn deletion_tears_down_cluster_installations() {
        let env = test_env(0).await;
        stable_cluster(&env).await;
        let installation = test_installation("gone.chat.example.com");
        env.store.create_installation(&installation).await.unwrap();

        let installations = InstallationSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );
        let cluster_installations = ClusterInstallationSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );

        drive_all(&[&installations as &dyn Supervisor, &cluster_installations], || async {
            env.store
                .get_installation(&installation.id)
                .await
                .unwrap()
                .unwrap()
                .state
                == InstallationState::Stable
        })
        .await;

        let mut stored = env
            .store
            .get_installation(&installation.id)
            .await
            .unwrap()
            .unwrap();
        stored.state = InstallationState::DeletionRequested;
        env.store.update_installation(&stored).await.unwrap();

        drive_all(&[&installations as &dyn Supervisor, &cluster_installations], || async {
            env.store
                .get_installation(&installation.id)
                .await
                .unwrap()
                .unwrap()
                .state
                == InstallationState::Deleted
        })
        .await;

        assert!(env
            .store
            .cluster_installations_for_installation(&installation.id)
            .await
            .unwrap()
            .is_empty());

        // Freed DNS can be reused by a new installation.
        env.store
            .create_installation(&test_installation("gone.chat.example.com"))
            .await
            .unwrap();
    }
}
