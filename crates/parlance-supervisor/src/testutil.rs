use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parlance_domain::{
    Cluster, DatabaseKind, EksMetadata, FilestoreKind, Installation, InstallationSize,
    ProvisionerKind, ProvisionerMetadata,
};
use parlance_events::{DelivererConfig, EventDeliverer, EventProducer, WebhookFanout};
use parlance_provisioner::{ProvisionerRegistry, StubProvisioner};
use parlance_store::{InMemoryStore, Store};
use tokio::sync::watch;

use crate::supervisor::Supervisor;

pub(crate) struct TestEnv {
    pub store: Arc<InMemoryStore>,
    pub stub: Arc<StubProvisioner>,
    pub registry: Arc<ProvisionerRegistry>,
    pub events: Arc<EventProducer>,
    _shutdown: watch::Sender<bool>,
}

/// Store + stub engines + a producer with delivery disabled, wired the way
/// the CLI wires the real thing.
pub(crate) async fn test_env(checks_before_ready: u32) -> TestEnv {
    let store = Arc::new(InMemoryStore::new());
    let stub = Arc::new(StubProvisioner::with_checks_before_ready(checks_before_ready));

    let mut registry = ProvisionerRegistry::new();
    registry.register_cluster(ProvisionerKind::Eks, stub.clone());
    registry.register_cluster(ProvisionerKind::Kops, stub.clone());
    registry.register_cluster_installation(ProvisionerKind::Eks, stub.clone());
    registry.register_cluster_installation(ProvisionerKind::Kops, stub.clone());

    let (shutdown, shutdown_rx) = watch::channel(false);
    let config = DelivererConfig {
        up_to_date_workers: 0,
        retry_workers: 0,
        max_burst_workers: 0,
        ..DelivererConfig::default()
    };
    let deliverer = Arc::new(
        EventDeliverer::new(
            store.clone() as Arc<dyn Store>,
            "test-instance",
            config,
            shutdown_rx,
        )
        .expect("client builds"),
    );
    let webhooks =
        Arc::new(WebhookFanout::new(store.clone() as Arc<dyn Store>).expect("client builds"));
    let events = Arc::new(EventProducer::new(
        store.clone() as Arc<dyn Store>,
        deliverer,
        webhooks,
    ));

    TestEnv {
        store,
        stub,
        registry: Arc::new(registry),
        events,
        _shutdown: shutdown,
    }
}

pub(crate) fn test_cluster() -> Cluster {
    Cluster::new(
        ProvisionerMetadata::Eks(EksMetadata {
            cluster_name: "test-eks".into(),
            version: "1.29".into(),
            node_role_arn: None,
            node_instance_type: "m5.large".into(),
            node_min_count: 2,
            node_max_count: 6,
        }),
        Utc::now(),
    )
}

pub(crate) fn test_installation(dns: &str) -> Installation {
    Installation::new(
        dns,
        InstallationSize::Users1000,
        "chat/server",
        "9.5.0",
        DatabaseKind::MultitenantRds,
        FilestoreKind::MultitenantS3,
        Utc::now(),
    )
    .expect("valid dns")
}

/// Tick the supervisors round-robin until `done`, or fail after a generous
/// number of rounds.
pub(crate) async fn drive_all<F, Fut>(supervisors: &[&dyn Supervisor], done: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..40 {
        if done().await {
            return;
        }
        for supervisor in supervisors {
            supervisor.do_work().await;
        }
    }
    assert!(done().await, "resource never reached the expected state");
}

pub(crate) async fn drive<S, F, Fut>(supervisor: &S, done: F)
where
    S: Supervisor,
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    drive_all(&[supervisor as &dyn Supervisor], done).await;
}
