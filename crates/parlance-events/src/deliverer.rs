use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parlance_domain::{
    DeliveryStatus, EventPayload, EventType, StateChangeEvent, Subscription,
    SubscriptionDeliveryStatus,
};
use parlance_store::Store;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EventsError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Sizing and timing of the delivery worker pools.
#[derive(Debug, Clone)]
pub struct DelivererConfig {
    /// Long-running workers claiming subscriptions with first-time work.
    pub up_to_date_workers: usize,
    /// Long-running workers claiming subscriptions with retrying work.
    pub retry_workers: usize,
    /// Cap on ephemeral workers spawned per `signal_new_events` call.
    /// Zero turns signals into no-ops.
    pub max_burst_workers: usize,
    /// Minimum pause between attempts of a retrying delivery.
    pub retry_delay: Duration,
    /// How long an idle worker sleeps before the next claim attempt.
    pub worker_idle_delay: Duration,
}

impl Default for DelivererConfig {
    fn default() -> Self {
        DelivererConfig {
            up_to_date_workers: 2,
            retry_workers: 2,
            max_burst_workers: 50,
            retry_delay: Duration::from_secs(20),
            worker_idle_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimMode {
    UpToDate,
    Retrying,
}

enum SendOutcome {
    Delivered,
    Failed,
}

/// Claim-based, bounded-concurrency delivery of state-change events to
/// subscriptions.
///
/// Deliveries for one subscription happen in event order; the first
/// retriable failure stops that subscription's pass so nothing overtakes it.
/// Discovery is poll-driven — producer signals only add burst capacity, so a
/// lost signal delays nothing forever.
pub struct EventDeliverer {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    instance_id: String,
    config: DelivererConfig,
    burst_permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl EventDeliverer {
    pub fn new(
        store: Arc<dyn Store>,
        instance_id: impl Into<String>,
        config: DelivererConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, EventsError> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let burst_permits = Arc::new(Semaphore::new(config.max_burst_workers));
        Ok(EventDeliverer {
            store,
            client,
            instance_id: instance_id.into(),
            config,
            burst_permits,
            shutdown,
        })
    }

    /// Override the retry cooldown. Tests shorten this to keep retry
    /// scenarios fast; back-off is constant for now.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.config.retry_delay = retry_delay;
        self
    }

    /// Spawn the persistent worker pools.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for _ in 0..self.config.up_to_date_workers {
            let this = self.clone();
            handles.push(tokio::spawn(this.worker_loop(ClaimMode::UpToDate)));
        }
        for _ in 0..self.config.retry_workers {
            let this = self.clone();
            handles.push(tokio::spawn(this.worker_loop(ClaimMode::Retrying)));
        }
        handles
    }

    /// A new event of `event_type` was produced: spin up ephemeral workers,
    /// one claim-and-process cycle each, bounded by the burst semaphore.
    /// Returns once every launched worker has finished. Advisory — the
    /// persistent pools deliver everything eventually regardless.
    pub async fn signal_new_events(self: Arc<Self>, event_type: EventType) {
        if self.config.max_burst_workers == 0 {
            return;
        }
        let count = match self.store.count_subscriptions_for_event(event_type).await {
            Ok(count) => count.max(0) as usize,
            Err(err) => {
                warn!(error = %err, "failed to count subscriptions, using burst maximum");
                self.config.max_burst_workers
            }
        };

        let exhausted = Arc::new(AtomicBool::new(false));
        let mut workers = JoinSet::new();
        for _ in 0..count {
            if exhausted.load(Ordering::SeqCst) {
                break;
            }
            let Ok(permit) = self.burst_permits.clone().acquire_owned().await else {
                break;
            };
            if exhausted.load(Ordering::SeqCst) {
                break;
            }
            let this = self.clone();
            let exhausted = exhausted.clone();
            workers.spawn(async move {
                let _permit = permit;
                match this.claim_and_process(ClaimMode::UpToDate).await {
                    Ok(true) => {}
                    Ok(false) => exhausted.store(true, Ordering::SeqCst),
                    Err(err) => {
                        warn!(error = %err, "burst delivery cycle failed");
                        exhausted.store(true, Ordering::SeqCst);
                    }
                }
            });
        }
        while workers.join_next().await.is_some() {}
    }

    async fn worker_loop(self: Arc<Self>, mode: ClaimMode) {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                return;
            }
            let idle = match self.claim_and_process(mode).await {
                Ok(processed) => !processed,
                Err(err) => {
                    warn!(error = %err, ?mode, "delivery cycle failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.worker_idle_delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// One cycle: claim a subscription, drain its pending events, release.
    /// Returns whether a subscription was claimed.
    async fn claim_and_process(&self, mode: ClaimMode) -> Result<bool, EventsError> {
        let claimed = match mode {
            ClaimMode::UpToDate => {
                self.store
                    .claim_up_to_date_subscription(&self.instance_id)
                    .await?
            }
            ClaimMode::Retrying => {
                self.store
                    .claim_retrying_subscription(&self.instance_id, self.config.retry_delay)
                    .await?
            }
        };
        let Some(mut subscription) = claimed else {
            return Ok(false);
        };

        let result = self.process_subscription(&mut subscription).await;
        if let Err(err) = self
            .store
            .unlock_subscription(subscription.id, &self.instance_id, false)
            .await
        {
            warn!(
                subscription_id = %subscription.id,
                error = %err,
                "failed to release subscription lock"
            );
        }
        result.map(|()| true)
    }

    async fn process_subscription(
        &self,
        subscription: &mut Subscription,
    ) -> Result<(), EventsError> {
        let pending = self.store.events_to_process(subscription.id).await?;
        debug!(
            subscription_id = %subscription.id,
            pending = pending.len(),
            "processing subscription events"
        );

        for mut data in pending {
            let now = Utc::now();
            data.delivery.attempts += 1;
            data.delivery.last_attempt = Some(now);
            subscription.last_delivery_attempt_at = Some(now);

            match self.send(subscription, &data.event).await {
                SendOutcome::Delivered => {
                    data.delivery.status = DeliveryStatus::Delivered;
                    subscription.last_delivery_status = SubscriptionDeliveryStatus::Succeeded;
                    self.store.update_event_delivery(&data.delivery).await?;
                }
                SendOutcome::Failed => {
                    subscription.last_delivery_status = SubscriptionDeliveryStatus::Failed;
                    let gave_up =
                        data.event.timestamp + subscription.failure_threshold() < now;
                    if gave_up {
                        data.delivery.status = DeliveryStatus::Failed;
                        self.store.update_event_delivery(&data.delivery).await?;
                        warn!(
                            subscription_id = %subscription.id,
                            event_id = %data.event.id,
                            attempts = data.delivery.attempts,
                            "giving up on event delivery"
                        );
                        continue;
                    }
                    data.delivery.status = DeliveryStatus::Retrying;
                    self.store.update_event_delivery(&data.delivery).await?;
                    // Stop here: delivering younger events before this one
                    // would break per-subscription ordering.
                    break;
                }
            }
        }

        self.store
            .update_subscription_delivery_status(subscription)
            .await?;
        Ok(())
    }

    async fn send(&self, subscription: &Subscription, event: &StateChangeEvent) -> SendOutcome {
        let headers = parse_headers(&subscription.headers, subscription.id);
        let payload = EventPayload::from(event);

        let response = self
            .client
            .post(&subscription.url)
            .headers(headers)
            .json(&payload)
            .send()
            .await;

        match response {
            Err(err) => {
                warn!(
                    subscription_id = %subscription.id,
                    event_id = %event.id,
                    error = %err,
                    "event delivery transport failure"
                );
                SendOutcome::Failed
            }
            Ok(response) => {
                let status = response.status().as_u16();
                if status >= 500 {
                    warn!(
                        subscription_id = %subscription.id,
                        event_id = %event.id,
                        status,
                        "event delivery failed on the consumer side"
                    );
                    SendOutcome::Failed
                } else {
                    if status != 200 {
                        // Consumer actively rejected the event; retrying
                        // would not change its mind.
                        debug!(
                            subscription_id = %subscription.id,
                            event_id = %event.id,
                            status,
                            "event rejected by consumer, marking delivered"
                        );
                    }
                    SendOutcome::Delivered
                }
            }
        }
    }
}

/// Build a header map from stored key/value pairs, skipping anything that is
/// not a valid header name or value.
pub(crate) fn parse_headers(headers: &BTreeMap<String, String>, context: Uuid) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(id = %context, header = %name, "skipping unparseable header"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use parlance_domain::{EventDeliveryData, ResourceType, StateChangeEvent};
    use parlance_store::InMemoryStore;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(max_burst_workers: usize) -> DelivererConfig {
        DelivererConfig {
            up_to_date_workers: 0,
            retry_workers: 0,
            max_burst_workers,
            retry_delay: Duration::from_secs(20),
            worker_idle_delay: Duration::from_millis(10),
        }
    }

    fn test_deliverer(
        store: Arc<InMemoryStore>,
        config: DelivererConfig,
    ) -> (Arc<EventDeliverer>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let deliverer =
            EventDeliverer::new(store, "test-instance", config, rx).expect("client builds");
        (Arc::new(deliverer), tx)
    }

    fn subscription(url: &str, failure_threshold: ChronoDuration) -> Subscription {
        Subscription::new(
            url,
            EventType::ResourceStateChange,
            "owner",
            failure_threshold,
            Utc::now(),
        )
    }

    fn event() -> StateChangeEvent {
        StateChangeEvent::new(
            ResourceType::Installation,
            "inst-1",
            "creation-requested",
            "creation-in-progress",
            BTreeMap::new(),
            Utc::now(),
        )
    }

    async fn pending_for(
        store: &InMemoryStore,
        subscription_id: Uuid,
    ) -> Vec<EventDeliveryData> {
        store.events_to_process(subscription_id).await.unwrap()
    }

    #[tokio::test]
    async fn happy_path_delivers_to_every_subscription() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(10)
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let mut subscription_ids = Vec::new();
        for _ in 0..10 {
            let sub = subscription(&server.uri(), ChronoDuration::minutes(5));
            subscription_ids.push(sub.id);
            store.create_subscription(&sub).await.unwrap();
        }
        let event = event();
        store.create_state_change_event(&event).await.unwrap();

        let (deliverer, _shutdown) = test_deliverer(store.clone(), test_config(50));
        deliverer.clone().signal_new_events(EventType::ResourceStateChange).await;

        let deliveries = store.deliveries_for_event(event.id).await.unwrap();
        assert_eq!(deliveries.len(), 10);
        assert!(deliveries
            .iter()
            .all(|d| d.status == DeliveryStatus::Delivered && d.attempts == 1));
        for id in subscription_ids {
            let sub = store.get_subscription(id).await.unwrap().unwrap();
            assert_eq!(sub.last_delivery_status, SubscriptionDeliveryStatus::Succeeded);
            assert!(sub.last_delivery_attempt_at.is_some());
            assert!(!sub.lease.is_locked(), "lock must be released");
        }
    }

    #[tokio::test]
    async fn custom_headers_are_sent_and_bad_ones_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-parlance-token", "secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let mut sub = subscription(&server.uri(), ChronoDuration::minutes(5));
        sub.headers.insert("X-Parlance-Token".into(), "secret".into());
        sub.headers.insert("bad header name".into(), "x".into());
        store.create_subscription(&sub).await.unwrap();
        store.create_state_change_event(&event()).await.unwrap();

        let (deliverer, _shutdown) = test_deliverer(store.clone(), test_config(5));
        deliverer.clone().signal_new_events(EventType::ResourceStateChange).await;

        let pending = pending_for(&store, sub.id).await;
        assert!(pending.is_empty(), "everything delivered");
    }

    #[tokio::test]
    async fn server_error_marks_delivery_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let sub = subscription(&server.uri(), ChronoDuration::minutes(1));
        store.create_subscription(&sub).await.unwrap();
        let event = event();
        store.create_state_change_event(&event).await.unwrap();

        let (deliverer, _shutdown) = test_deliverer(store.clone(), test_config(5));
        deliverer.clone().signal_new_events(EventType::ResourceStateChange).await;

        let deliveries = store.deliveries_for_event(event.id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, DeliveryStatus::Retrying);
        assert_eq!(deliveries[0].attempts, 1);
        let sub = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.last_delivery_status, SubscriptionDeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn retry_worker_attempts_again_after_cooldown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let sub = subscription(&server.uri(), ChronoDuration::minutes(1));
        store.create_subscription(&sub).await.unwrap();
        let event = event();
        store.create_state_change_event(&event).await.unwrap();

        let config = DelivererConfig {
            up_to_date_workers: 0,
            retry_workers: 1,
            max_burst_workers: 5,
            retry_delay: Duration::from_millis(50),
            worker_idle_delay: Duration::from_millis(10),
        };
        let (deliverer, shutdown) = test_deliverer(store.clone(), config);
        // First pass leaves the delivery retrying.
        deliverer.clone().signal_new_events(EventType::ResourceStateChange).await;

        let handles = deliverer.clone().start();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let deliveries = store.deliveries_for_event(event.id).await.unwrap();
            if deliveries[0].attempts >= 2 {
                assert_eq!(deliveries[0].status, DeliveryStatus::Retrying);
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "second attempt never happened"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.send(true).ok();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn zero_failure_threshold_gives_up_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let sub = subscription(&server.uri(), ChronoDuration::zero());
        store.create_subscription(&sub).await.unwrap();
        let event = event();
        store.create_state_change_event(&event).await.unwrap();

        let (deliverer, _shutdown) = test_deliverer(store.clone(), test_config(5));
        deliverer.clone().signal_new_events(EventType::ResourceStateChange).await;

        let deliveries = store.deliveries_for_event(event.id).await.unwrap();
        assert_eq!(deliveries[0].status, DeliveryStatus::Failed);
        assert_eq!(deliveries[0].attempts, 1);

        // A failed delivery is never claimed for retry.
        assert!(store
            .claim_retrying_subscription("test-instance", Duration::from_millis(0))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn first_retriable_failure_preserves_ordering() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let sub = subscription(&server.uri(), ChronoDuration::minutes(10));
        store.create_subscription(&sub).await.unwrap();

        let older = StateChangeEvent::new(
            ResourceType::Cluster,
            "c1",
            "creating",
            "created",
            BTreeMap::new(),
            Utc::now() - ChronoDuration::seconds(10),
        );
        let newer = event();
        store.create_state_change_event(&older).await.unwrap();
        store.create_state_change_event(&newer).await.unwrap();

        let (deliverer, _shutdown) = test_deliverer(store.clone(), test_config(5));
        deliverer.clone().signal_new_events(EventType::ResourceStateChange).await;

        let older_deliveries = store.deliveries_for_event(older.id).await.unwrap();
        assert_eq!(older_deliveries[0].status, DeliveryStatus::Retrying);
        let newer_deliveries = store.deliveries_for_event(newer.id).await.unwrap();
        assert_eq!(
            newer_deliveries[0].status,
            DeliveryStatus::NotAttempted,
            "younger event must not overtake the retrying one"
        );
        assert_eq!(newer_deliveries[0].attempts, 0);
    }

    #[tokio::test]
    async fn burst_is_bounded_but_drains_everything() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(10)))
            .expect(30)
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        for _ in 0..30 {
            store
                .create_subscription(&subscription(&server.uri(), ChronoDuration::minutes(5)))
                .await
                .unwrap();
        }
        let event = event();
        store.create_state_change_event(&event).await.unwrap();

        let (deliverer, _shutdown) = test_deliverer(store.clone(), test_config(5));
        deliverer.clone().signal_new_events(EventType::ResourceStateChange).await;

        let deliveries = store.deliveries_for_event(event.id).await.unwrap();
        assert_eq!(deliveries.len(), 30);
        assert!(deliveries.iter().all(|d| d.status == DeliveryStatus::Delivered));
        // All burst permits are back once the signal call returns.
        assert_eq!(deliverer.burst_permits.available_permits(), 5);
    }

    #[tokio::test]
    async fn zero_burst_workers_makes_signals_noops() {
        let store = Arc::new(InMemoryStore::new());
        let sub = subscription("http://127.0.0.1:9/unreachable", ChronoDuration::minutes(5));
        store.create_subscription(&sub).await.unwrap();
        store.create_state_change_event(&event()).await.unwrap();

        let (deliverer, _shutdown) = test_deliverer(store.clone(), test_config(0));
        deliverer.clone().signal_new_events(EventType::ResourceStateChange).await;

        let pending = pending_for(&store, sub.id).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delivery.status, DeliveryStatus::NotAttempted);
    }

    #[tokio::test]
    async fn non_200_success_statuses_count_as_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let sub = subscription(&server.uri(), ChronoDuration::minutes(5));
        store.create_subscription(&sub).await.unwrap();
        let event = event();
        store.create_state_change_event(&event).await.unwrap();

        let (deliverer, _shutdown) = test_deliverer(store.clone(), test_config(5));
        deliverer.clone().signal_new_events(EventType::ResourceStateChange).await;

        let deliveries = store.deliveries_for_event(event.id).await.unwrap();
        assert_eq!(
            deliveries[0].status,
            DeliveryStatus::Delivered,
            "consumer rejection is not retriable"
        );
    }
}
