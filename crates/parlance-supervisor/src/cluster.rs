use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parlance_domain::{Cluster, ClusterState, ResourceType};
use parlance_events::EventProducer;
use parlance_provisioner::{ClusterProvisioner, ProvisionerRegistry};
use parlance_store::Store;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::supervisor::{for_each_bounded, record_transition, try_lock, unlock, Supervisor};

/// Advances clusters through creation, provisioning, upgrade, resize and
/// deletion, one transition per tick per cluster.
#[derive(Clone)]
pub struct ClusterSupervisor {
    store: Arc<dyn Store>,
    registry: Arc<ProvisionerRegistry>,
    events: Arc<EventProducer>,
    instance_id: String,
    concurrency: usize,
}

impl ClusterSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ProvisionerRegistry>,
        events: Arc<EventProducer>,
        instance_id: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        ClusterSupervisor {
            store,
            registry,
            events,
            instance_id: instance_id.into(),
            concurrency: concurrency.max(1),
        }
    }

    async fn supervise(&self, candidate: Cluster) {
        let id = candidate.id.clone();
        if !try_lock(&self.store, ResourceType::Cluster, id.as_str(), &self.instance_id).await {
            return;
        }

        // Reload under the lock; the candidate snapshot may be stale.
        let reloaded = match self.store.get_cluster(&id).await {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                unlock(&self.store, ResourceType::Cluster, id.as_str(), &self.instance_id).await;
                return;
            }
            Err(err) => {
                warn!(cluster_id = %id, error = %err, "failed to reload cluster");
                unlock(&self.store, ResourceType::Cluster, id.as_str(), &self.instance_id).await;
                return;
            }
        };
        if !reloaded.state.pending_work() {
            unlock(&self.store, ResourceType::Cluster, id.as_str(), &self.instance_id).await;
            return;
        }

        let mut cluster = reloaded;
        let old_state = cluster.state;
        self.transition(&mut cluster).await;
        debug!(
            cluster_id = %id,
            old_state = %old_state,
            new_state = %cluster.state,
            "cluster supervised"
        );

        match self.store.update_cluster(&cluster).await {
            Err(err) => warn!(cluster_id = %id, error = %err, "failed to persist cluster"),
            Ok(()) if cluster.state != old_state => {
                let mut extra = BTreeMap::new();
                extra.insert("provisioner".to_string(), cluster.provisioner.to_string());
                record_transition(
                    &self.events,
                    ResourceType::Cluster,
                    id.as_str(),
                    old_state.as_str(),
                    cluster.state.as_str(),
                    extra,
                )
                .await;
            }
            Ok(()) => {}
        }

        unlock(&self.store, ResourceType::Cluster, id.as_str(), &self.instance_id).await;
    }

    async fn transition(&self, cluster: &mut Cluster) {
        let provisioner = match self.registry.for_cluster(cluster) {
            Ok(provisioner) => provisioner,
            Err(err) => {
                warn!(cluster_id = %cluster.id, error = %err, "no provisioner for cluster");
                cluster.record_warning(err.to_string(), Utc::now());
                return;
            }
        };

        let result = match cluster.state {
            ClusterState::CreationRequested | ClusterState::CreationFailed => {
                self.create(cluster, &provisioner).await
            }
            ClusterState::Creating => self.check_creating(cluster, &provisioner).await,
            ClusterState::Created => self.wait_for_nodes(cluster, &provisioner).await,
            ClusterState::ProvisioningRequested | ClusterState::ProvisioningFailed => {
                self.provision(cluster, &provisioner).await
            }
            ClusterState::ProvisioningInProgress => {
                self.check_provisioned(cluster, &provisioner).await
            }
            ClusterState::UpgradeRequested | ClusterState::UpgradeFailed => {
                self.upgrade(cluster, &provisioner).await
            }
            ClusterState::Upgrading => self.check_settled(cluster, &provisioner, true).await,
            ClusterState::ResizeRequested | ClusterState::ResizeFailed => {
                self.resize(cluster, &provisioner).await
            }
            ClusterState::Resizing => self.check_settled(cluster, &provisioner, false).await,
            ClusterState::DeletionRequested
            | ClusterState::DeletionFailed
            | ClusterState::Deleting => self.delete(cluster, &provisioner).await,
            ClusterState::Stable | ClusterState::Deleted => Ok(cluster.state),
        };

        match result {
            Ok(next) => cluster.state = next,
            Err(err) => {
                warn!(
                    cluster_id = %cluster.id,
                    state = %cluster.state,
                    error = %err,
                    "cluster transition failed"
                );
                cluster.record_warning(err.to_string(), Utc::now());
                if err.is_permanent() {
                    if let Some(failed) = failed_state_for(cluster.state) {
                        cluster.state = failed;
                    }
                }
            }
        }
    }

    async fn create(
        &self,
        cluster: &mut Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> Result<ClusterState, SupervisorError> {
        cluster.provisioner_metadata = provisioner.prepare(cluster).await?;
        provisioner.create(cluster).await?;
        info!(cluster_id = %cluster.id, "cluster creation dispatched");
        Ok(ClusterState::Creating)
    }

    async fn check_creating(
        &self,
        cluster: &Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> Result<ClusterState, SupervisorError> {
        if provisioner.check_created(cluster).await? {
            Ok(ClusterState::Created)
        } else {
            Ok(ClusterState::Creating)
        }
    }

    async fn wait_for_nodes(
        &self,
        cluster: &Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> Result<ClusterState, SupervisorError> {
        provisioner.create_nodes(cluster).await?;
        if provisioner.check_nodes_created(cluster).await? {
            Ok(ClusterState::ProvisioningRequested)
        } else {
            Ok(ClusterState::Created)
        }
    }

    async fn provision(
        &self,
        cluster: &mut Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> Result<ClusterState, SupervisorError> {
        let deployed = provisioner.provision(cluster).await?;
        for (name, version) in deployed {
            cluster
                .utility_versions
                .entry(name)
                .or_default()
                .actual = version;
        }
        Ok(ClusterState::ProvisioningInProgress)
    }

    async fn check_provisioned(
        &self,
        cluster: &Cluster,
        _provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> Result<ClusterState, SupervisorError> {
        if cluster.utilities_converged() {
            info!(cluster_id = %cluster.id, "cluster is stable");
            Ok(ClusterState::Stable)
        } else {
            Ok(ClusterState::ProvisioningInProgress)
        }
    }

    async fn upgrade(
        &self,
        cluster: &Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> Result<ClusterState, SupervisorError> {
        provisioner.upgrade(cluster).await?;
        provisioner.rotate_nodes(cluster).await?;
        Ok(ClusterState::Upgrading)
    }

    async fn resize(
        &self,
        cluster: &Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> Result<ClusterState, SupervisorError> {
        provisioner.resize(cluster).await?;
        Ok(ClusterState::Resizing)
    }

    /// Upgrades and resizes settle the same way: the control plane reports
    /// healthy again, then metadata is re-read from the engine.
    async fn check_settled(
        &self,
        cluster: &mut Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
        refresh: bool,
    ) -> Result<ClusterState, SupervisorError> {
        if !provisioner.check_created(cluster).await? {
            return Ok(cluster.state);
        }
        if refresh {
            cluster.provisioner_metadata = provisioner.refresh_metadata(cluster).await?;
        }
        Ok(ClusterState::Stable)
    }

    async fn delete(
        &self,
        cluster: &Cluster,
        provisioner: &Arc<dyn ClusterProvisioner>,
    ) -> Result<ClusterState, SupervisorError> {
        if provisioner.delete(cluster).await? {
            info!(cluster_id = %cluster.id, "cluster deleted");
            Ok(ClusterState::Deleted)
        } else {
            Ok(ClusterState::Deleting)
        }
    }
}

fn failed_state_for(state: ClusterState) -> Option<ClusterState> {
    match state {
        ClusterState::CreationRequested | ClusterState::Creating | ClusterState::Created => {
            Some(ClusterState::CreationFailed)
        }
        ClusterState::ProvisioningRequested | ClusterState::ProvisioningInProgress => {
            Some(ClusterState::ProvisioningFailed)
        }
        ClusterState::UpgradeRequested | ClusterState::Upgrading => {
            Some(ClusterState::UpgradeFailed)
        }
        ClusterState::ResizeRequested | ClusterState::Resizing => {
            Some(ClusterState::ResizeFailed)
        }
        ClusterState::DeletionRequested | ClusterState::Deleting => {
            Some(ClusterState::DeletionFailed)
        }
        _ => None,
    }
}

#[async_trait]
impl Supervisor for ClusterSupervisor {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn do_work(&self) {
        let clusters = match self.store.clusters_pending_work().await {
            Ok(clusters) => clusters,
            Err(err) => {
                warn!(error = %err, "failed to scan clusters pending work");
                return;
            }
        };
        let this = self.clone();
        for_each_bounded(clusters, self.concurrency, move |cluster| {
            let this = this.clone();
            async move { this.supervise(cluster).await }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{drive, test_cluster, test_env};
    use parlance_domain::UtilityVersions;

    #[tokio::test]
    async fn cluster_reaches_stable_through_the_full_chain() {
        let env = test_env(1).await;
        let mut cluster = test_cluster();
        cluster
            .utility_versions
            .insert("ingress-nginx".into(), UtilityVersions {
                desired: "4.10.0".into(),
                actual: String::new(),
            });
        env.store.create_cluster(&cluster).await.unwrap();

        let supervisor = ClusterSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );

        drive(&supervisor, || async {
            env.store
                .get_cluster(&cluster.id)
                .await
                .unwrap()
                .unwrap()
                .state
                == ClusterState::Stable
        })
        .await;

        let stored = env.store.get_cluster(&cluster.id).await.unwrap().unwrap();
        assert!(stored.utilities_converged());
        assert!(!stored.lease.is_locked(), "lock released after every tick");

        // Every hop along the chain produced an event.
        let events = env.store.list_state_change_events(100).await.unwrap();
        let states: Vec<&str> = events.iter().map(|e| e.new_state.as_str()).collect();
        assert!(states.contains(&"creating"));
        assert!(states.contains(&"created"));
        assert!(states.contains(&"provisioning-in-progress"));
        assert!(states.contains(&"stable"));
    }

    #[tokio::test]
    async fn transient_remote_failure_stays_and_records_warning() {
        let env = test_env(0).await;
        let cluster = test_cluster();
        env.store.create_cluster(&cluster).await.unwrap();
        env.stub.set_fail_remote(true);

        let supervisor = ClusterSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );
        supervisor.do_work().await;

        let stored = env.store.get_cluster(&cluster.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ClusterState::CreationRequested, "stays put");
        assert!(stored.last_warning.is_some(), "operator-visible warning recorded");

        // The failure clears; the next ticks make progress.
        env.stub.set_fail_remote(false);
        drive(&supervisor, || async {
            env.store
                .get_cluster(&cluster.id)
                .await
                .unwrap()
                .unwrap()
                .state
                == ClusterState::Stable
        })
        .await;
    }

    #[tokio::test]
    async fn validation_failure_moves_to_failed_state() {
        let env = test_env(0).await;
        let cluster = test_cluster();
        env.store.create_cluster(&cluster).await.unwrap();
        env.stub.set_fail_validation(true);

        let supervisor = ClusterSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );
        supervisor.do_work().await;

        let stored = env.store.get_cluster(&cluster.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ClusterState::CreationFailed);
        assert!(stored.last_warning.is_some());

        // Failed states are re-scanned: recovery retries the step.
        env.stub.set_fail_validation(false);
        drive(&supervisor, || async {
            env.store
                .get_cluster(&cluster.id)
                .await
                .unwrap()
                .unwrap()
                .state
                == ClusterState::Stable
        })
        .await;
    }

    #[tokio::test]
    async fn deletion_polls_until_gone() {
        let env = test_env(1).await;
        let mut cluster = test_cluster();
        cluster.state = ClusterState::DeletionRequested;
        env.store.create_cluster(&cluster).await.unwrap();

        let supervisor = ClusterSupervisor::new(
            env.store.clone(),
            env.registry.clone(),
            env.events.clone(),
            "test-instance",
            1,
        );

        supervisor.do_work().await;
        let stored = env.store.get_cluster(&cluster.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ClusterState::Deleting, "first poll not yet gone");

        supervisor.do_work().await;
        let stored = env.store.get_cluster(&cluster.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ClusterState::Deleted);
    }
}
