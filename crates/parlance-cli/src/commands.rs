use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parlance_api::build_app;
use parlance_config::{Config, StoreKind, SupervisorCadence};
use parlance_domain::ProvisionerKind;
use parlance_events::{DelivererConfig, EventDeliverer, EventProducer, WebhookFanout};
use parlance_provisioner::{ProvisionerRegistry, StubImportBackend, StubProvisioner};
use parlance_store::{InMemoryStore, PostgresStore, Store};
use parlance_supervisor::{
    BackupSupervisor, ClusterInstallationSupervisor, ClusterSupervisor, ImportSupervisor,
    InstallationSupervisor, MigrationSupervisor, RestorationSupervisor, Scheduler, Supervisor,
};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let config = match &config_path {
        Some(path) => parlance_config::load_config(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let instance_id = Uuid::new_v4().to_string();

    let store: Arc<dyn Store> = match config.store.kind {
        StoreKind::Memory => Arc::new(InMemoryStore::new()),
        StoreKind::Postgres => {
            let url = config
                .store
                .postgres_url
                .as_deref()
                .ok_or_else(|| anyhow!("store.postgres_url is required for the postgres store"))?;
            Arc::new(PostgresStore::connect(url).await?)
        }
    };

    // The stub engine realizes clusters in-process; real engines register
    // behind the same kinds.
    let stub = Arc::new(StubProvisioner::new());
    let mut registry = ProvisionerRegistry::new();
    registry.register_cluster(ProvisionerKind::Kops, stub.clone());
    registry.register_cluster(ProvisionerKind::Eks, stub.clone());
    registry.register_cluster_installation(ProvisionerKind::Kops, stub.clone());
    registry.register_cluster_installation(ProvisionerKind::Eks, stub.clone());
    let registry = Arc::new(registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let deliverer = Arc::new(EventDeliverer::new(
        store.clone(),
        &instance_id,
        DelivererConfig {
            up_to_date_workers: config.events.up_to_date_workers,
            retry_workers: config.events.retry_workers,
            max_burst_workers: config.events.max_burst_workers,
            retry_delay: Duration::from_secs(config.events.retry_delay_seconds),
            worker_idle_delay: Duration::from_millis(config.events.worker_idle_delay_millis),
        },
        shutdown_rx,
    )?);
    let delivery_workers = deliverer.clone().start();
    let webhooks = Arc::new(WebhookFanout::new(store.clone())?);
    let events = Arc::new(EventProducer::new(store.clone(), deliverer, webhooks));

    let cadence = |c: SupervisorCadence| Duration::from_secs(c.poll_seconds);
    let sup = &config.supervisors;
    let supervisors: Vec<(Arc<dyn Supervisor>, Duration)> = vec![
        (
            Arc::new(ClusterSupervisor::new(
                store.clone(),
                registry.clone(),
                events.clone(),
                &instance_id,
                sup.cluster.concurrency,
            )),
            cadence(sup.cluster),
        ),
        (
            Arc::new(InstallationSupervisor::new(
                store.clone(),
                registry.clone(),
                events.clone(),
                &instance_id,
                sup.installation.concurrency,
            )),
            cadence(sup.installation),
        ),
        (
            Arc::new(ClusterInstallationSupervisor::new(
                store.clone(),
                registry.clone(),
                events.clone(),
                &instance_id,
                sup.cluster_installation.concurrency,
            )),
            cadence(sup.cluster_installation),
        ),
        (
            Arc::new(BackupSupervisor::new(
                store.clone(),
                stub.clone(),
                events.clone(),
                &instance_id,
                sup.backup.concurrency,
            )),
            cadence(sup.backup),
        ),
        (
            Arc::new(RestorationSupervisor::new(
                store.clone(),
                stub.clone(),
                events.clone(),
                &instance_id,
                sup.restoration.concurrency,
            )),
            cadence(sup.restoration),
        ),
        (
            Arc::new(MigrationSupervisor::new(
                store.clone(),
                stub.clone(),
                events.clone(),
                &instance_id,
                sup.migration.concurrency,
            )),
            cadence(sup.migration),
        ),
        (
            Arc::new(ImportSupervisor::new(
                store.clone(),
                Arc::new(StubImportBackend::new()),
                events.clone(),
                &instance_id,
            )),
            cadence(sup.import),
        ),
    ];
    let scheduler = Scheduler::start(supervisors);

    let auth_token = Arc::new(config.api.auth_token.clone().unwrap_or_default());
    let app = build_app(
        store.clone(),
        events.clone(),
        auth_token,
        config.databases.max_installation_weight,
    );
    let listener = tokio::net::TcpListener::bind(&config.api.bind)
        .await
        .with_context(|| format!("binding {}", config.api.bind))?;
    info!(bind = %config.api.bind, instance_id = %instance_id, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    scheduler.shutdown().await;
    for worker in delivery_workers {
        let _ = worker.await;
    }
    Ok(())
}

pub async fn check(url: String, token: Option<String>) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let mut request = client.get(format!("{}/health", url.trim_end_matches('/')));
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.context("health request failed")?;
    if !response.status().is_success() {
        return Err(anyhow!("control plane unhealthy: {}", response.status()));
    }
    println!("ok");
    Ok(())
}
