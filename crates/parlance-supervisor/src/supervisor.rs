use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parlance_domain::{InstallationId, InstallationState, ResourceType};
use parlance_events::EventProducer;
use parlance_store::Store;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::SupervisorError;

/// One per resource kind. The scheduler ticks `do_work` on a cadence; a tick
/// scans for pending work and advances each claimed resource one transition.
/// Ticks never fail — everything is logged or recorded on the resource.
#[async_trait]
pub trait Supervisor: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn do_work(&self);
}

/// Run one task per item, at most `limit` in flight. `limit <= 1` degrades
/// to a plain sequential loop.
pub(crate) async fn for_each_bounded<T, F, Fut>(items: Vec<T>, limit: usize, make_task: F)
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    if limit <= 1 {
        for item in items {
            make_task(item).await;
        }
        return;
    }
    let permits = Arc::new(Semaphore::new(limit));
    let mut tasks = JoinSet::new();
    for item in items {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let task = make_task(item);
        tasks.spawn(async move {
            let _permit = permit;
            task.await;
        });
    }
    while tasks.join_next().await.is_some() {}
}

/// Acquire the per-resource lease; a refused or failed acquisition skips the
/// resource until a later tick.
pub(crate) async fn try_lock(
    store: &Arc<dyn Store>,
    resource_type: ResourceType,
    id: &str,
    instance_id: &str,
) -> bool {
    match store.lock_resource(resource_type, id, instance_id).await {
        Ok(acquired) => acquired,
        Err(err) => {
            warn!(%resource_type, resource_id = id, error = %err, "failed to acquire lock");
            false
        }
    }
}

pub(crate) async fn unlock(
    store: &Arc<dyn Store>,
    resource_type: ResourceType,
    id: &str,
    instance_id: &str,
) {
    if let Err(err) = store.unlock_resource(resource_type, id, instance_id, false).await {
        warn!(%resource_type, resource_id = id, error = %err, "failed to release lock");
    }
}

/// Move a parked installation to `new_state` under its own lease, recording
/// the transition. The operation supervisors use this to hand installations
/// back when their operation finishes or fails.
pub(crate) async fn set_installation_state(
    store: &Arc<dyn Store>,
    events: &EventProducer,
    instance_id: &str,
    installation_id: &InstallationId,
    new_state: InstallationState,
) -> Result<(), SupervisorError> {
    if !try_lock(store, ResourceType::Installation, installation_id.as_str(), instance_id).await {
        return Err(SupervisorError::Invariant(format!(
            "installation {installation_id} is locked elsewhere"
        )));
    }

    let result = async {
        let mut installation = store
            .get_installation(installation_id)
            .await?
            .ok_or_else(|| {
                SupervisorError::Invariant(format!("installation {installation_id} is gone"))
            })?;
        let old_state = installation.state;
        if old_state == new_state {
            return Ok(());
        }
        installation.state = new_state;
        store.update_installation(&installation).await?;
        record_transition(
            events,
            ResourceType::Installation,
            installation_id.as_str(),
            old_state.as_str(),
            new_state.as_str(),
            BTreeMap::new(),
        )
        .await;
        Ok(())
    }
    .await;

    unlock(store, ResourceType::Installation, installation_id.as_str(), instance_id).await;
    result
}

/// Record a transition with the event producer. Producer failures never
/// block the transition that caused them.
pub(crate) async fn record_transition(
    events: &EventProducer,
    resource_type: ResourceType,
    id: &str,
    old_state: &str,
    new_state: &str,
    extra_data: BTreeMap<String, String>,
) {
    if let Err(err) = events
        .produce(resource_type, id, old_state, new_state, extra_data)
        .await
    {
        warn!(
            %resource_type,
            resource_id = id,
            old_state,
            new_state,
            error = %err,
            "failed to record state change event"
        );
    }
}
