use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parlance_domain::{ResourceType, StateChangeEvent, WebhookPayload};
use parlance_store::Store;
use tracing::warn;

use crate::deliverer::EventDeliverer;
use crate::error::EventsError;
use crate::webhook::WebhookFanout;

/// Records state transitions durably and nudges the delivery side.
///
/// Event creation is not in the same transaction as the resource update that
/// caused it; the deliverer compensates by polling, so the signal here is
/// advisory and allowed to be lost.
pub struct EventProducer {
    store: Arc<dyn Store>,
    deliverer: Arc<EventDeliverer>,
    webhooks: Arc<WebhookFanout>,
}

impl EventProducer {
    pub fn new(
        store: Arc<dyn Store>,
        deliverer: Arc<EventDeliverer>,
        webhooks: Arc<WebhookFanout>,
    ) -> Self {
        EventProducer { store, deliverer, webhooks }
    }

    /// Persist a state-change event, signal the deliverer, and fan out the
    /// legacy webhook payload. Only the persistence step can fail the call;
    /// the rest is best-effort.
    pub async fn produce(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        old_state: &str,
        new_state: &str,
        extra_data: BTreeMap<String, String>,
    ) -> Result<(), EventsError> {
        let event = StateChangeEvent::new(
            resource_type,
            resource_id,
            old_state,
            new_state,
            extra_data,
            Utc::now(),
        );
        self.store.create_state_change_event(&event).await?;

        let deliverer = self.deliverer.clone();
        let event_type = event.event_type;
        tokio::spawn(async move {
            deliverer.signal_new_events(event_type).await;
        });

        let payload = WebhookPayload::from(&event);
        if let Err(err) = self.webhooks.send_to_all(&payload).await {
            warn!(
                resource_id,
                error = %err,
                "legacy webhook fanout failed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliverer::DelivererConfig;
    use parlance_domain::{DeliveryStatus, EventType, Subscription};
    use parlance_store::InMemoryStore;
    use tokio::sync::watch;

    fn producer(store: Arc<InMemoryStore>) -> EventProducer {
        let (_tx, rx) = watch::channel(false);
        let config = DelivererConfig {
            up_to_date_workers: 0,
            retry_workers: 0,
            max_burst_workers: 0,
            ..DelivererConfig::default()
        };
        let deliverer = Arc::new(
            EventDeliverer::new(store.clone(), "test-instance", config, rx).expect("client"),
        );
        let webhooks = Arc::new(WebhookFanout::new(store.clone()).expect("client"));
        EventProducer::new(store, deliverer, webhooks)
    }

    #[tokio::test]
    async fn produce_persists_event_and_delivery_rows() {
        let store = Arc::new(InMemoryStore::new());
        let sub = Subscription::new(
            "http://127.0.0.1:9/unused",
            EventType::ResourceStateChange,
            "owner",
            chrono::Duration::minutes(5),
            Utc::now(),
        );
        store.create_subscription(&sub).await.unwrap();

        producer(store.clone())
            .produce(
                ResourceType::Cluster,
                "cluster-1",
                "creating",
                "created",
                BTreeMap::new(),
            )
            .await
            .unwrap();

        let pending = store.events_to_process(sub.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delivery.status, DeliveryStatus::NotAttempted);
        assert_eq!(pending[0].event.old_state, "creating");
        assert_eq!(pending[0].event.new_state, "created");
    }
}
