use std::collections::BTreeMap;
use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use parlance_domain::{
    Cluster, ClusterId, DatabaseKind, EksMetadata, EventType, FilestoreKind, Installation,
    InstallationId, InstallationSize, InstallationState, KopsMetadata, MultitenantDatabase,
    ProvisionerKind, ProvisionerMetadata, ResourceType, Subscription, UtilityVersions, Webhook,
};
use parlance_supervisor::{
    trigger_installation_backup, trigger_installation_db_migration,
    trigger_installation_db_restoration,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.store.list_clusters().await?;
    Ok(StatusCode::OK)
}

// ── Clusters ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateClusterRequest {
    pub provisioner: ProvisionerKind,
    #[serde(default = "default_kubernetes_version")]
    pub version: String,
    #[serde(default = "default_node_instance_type")]
    pub node_instance_type: String,
    #[serde(default = "default_node_min_count")]
    pub node_min_count: u32,
    #[serde(default = "default_node_max_count")]
    pub node_max_count: u32,
    /// Utility name → desired version.
    #[serde(default)]
    pub utilities: BTreeMap<String, String>,
}

fn default_kubernetes_version() -> String {
    "1.29".to_string()
}

fn default_node_instance_type() -> String {
    "m5.large".to_string()
}

fn default_node_min_count() -> u32 {
    2
}

fn default_node_max_count() -> u32 {
    6
}

pub async fn create_cluster(
    State(state): State<AppState>,
    Json(body): Json<CreateClusterRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let metadata = match body.provisioner {
        ProvisionerKind::Kops => ProvisionerMetadata::Kops(KopsMetadata {
            name: String::new(),
            version: body.version,
            master_instance_type: body.node_instance_type.clone(),
            node_instance_type: body.node_instance_type,
            node_min_count: body.node_min_count,
            node_max_count: body.node_max_count,
        }),
        ProvisionerKind::Eks => ProvisionerMetadata::Eks(EksMetadata {
            cluster_name: String::new(),
            version: body.version,
            node_role_arn: None,
            node_instance_type: body.node_instance_type,
            node_min_count: body.node_min_count,
            node_max_count: body.node_max_count,
        }),
    };
    let mut cluster = Cluster::new(metadata, Utc::now());
    for (name, desired) in body.utilities {
        cluster
            .utility_versions
            .insert(name, UtilityVersions { desired, actual: String::new() });
    }
    state.store.create_cluster(&cluster).await?;
    Ok((StatusCode::CREATED, Json(json!(cluster))))
}

pub async fn list_clusters(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let clusters = state.store.list_clusters().await?;
    Ok(Json(json!(clusters)))
}

pub async fn get_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let cluster = state
        .store
        .get_cluster(&ClusterId::new(&id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("cluster '{id}' not found")))?;
    Ok(Json(json!(cluster)))
}

// ── Installations ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateInstallationRequest {
    pub dns: String,
    #[serde(default = "default_size")]
    pub size: InstallationSize,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_database")]
    pub database: DatabaseKind,
    #[serde(default = "default_filestore")]
    pub filestore: FilestoreKind,
    pub license: Option<String>,
    pub group_id: Option<String>,
}

fn default_size() -> InstallationSize {
    InstallationSize::Users100
}

fn default_image() -> String {
    "parlance/chat-server".to_string()
}

fn default_version() -> String {
    "9.5.0".to_string()
}

fn default_database() -> DatabaseKind {
    DatabaseKind::MultitenantRds
}

fn default_filestore() -> FilestoreKind {
    FilestoreKind::MultitenantS3
}

pub async fn create_installation(
    State(state): State<AppState>,
    Json(body): Json<CreateInstallationRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if state.store.installation_by_dns(&body.dns).await?.is_some() {
        return Err(ApiError {
            status: StatusCode::CONFLICT,
            message: format!("dns {} already in use", body.dns),
        });
    }
    let mut installation = Installation::new(
        body.dns,
        body.size,
        body.image,
        body.version,
        body.database,
        body.filestore,
        Utc::now(),
    )
    .map_err(|e| ApiError::bad_request(e.to_string()))?;
    installation.license = body.license;
    installation.group_id = body.group_id;

    state.store.create_installation(&installation).await?;
    Ok((StatusCode::CREATED, Json(json!(installation))))
}

pub async fn list_installations(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let installations = state.store.list_installations().await?;
    Ok(Json(json!(installations)))
}

pub async fn get_installation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let installation = state
        .store
        .get_installation(&InstallationId::new(&id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("installation '{id}' not found")))?;
    Ok(Json(json!(installation)))
}

pub async fn hibernate_installation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    request_installation_state(
        &state,
        &id,
        &[InstallationState::Stable],
        InstallationState::HibernationRequested,
    )
    .await
}

pub async fn wake_up_installation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    request_installation_state(
        &state,
        &id,
        &[InstallationState::Hibernating],
        InstallationState::WakeUpRequested,
    )
    .await
}

pub async fn delete_installation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    request_installation_state(
        &state,
        &id,
        &[
            InstallationState::Stable,
            InstallationState::Hibernating,
            InstallationState::DeletionPending,
            InstallationState::CreationFailed,
        ],
        InstallationState::DeletionRequested,
    )
    .await
}

async fn request_installation_state(
    state: &AppState,
    id: &str,
    allowed: &[InstallationState],
    next: InstallationState,
) -> Result<Json<Value>, ApiError> {
    let installation_id = InstallationId::new(id);
    let mut installation = state
        .store
        .get_installation(&installation_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("installation '{id}' not found")))?;
    if !allowed.contains(&installation.state) {
        return Err(ApiError::bad_request(format!(
            "cannot request {} while installation is {}",
            next, installation.state
        )));
    }

    let old_state = installation.state;
    installation.state = next;
    state.store.update_installation(&installation).await?;
    if let Err(err) = state
        .events
        .produce(
            ResourceType::Installation,
            id,
            old_state.as_str(),
            next.as_str(),
            BTreeMap::new(),
        )
        .await
    {
        warn!(installation_id = id, error = %err, "failed to record state change event");
    }
    Ok(Json(json!(installation)))
}

// ── Lifecycle operations ──────────────────────────────────────────────────────

pub async fn trigger_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let backup =
        trigger_installation_backup(&state.store, &state.events, &InstallationId::new(&id))
            .await
            .map_err(ApiError::from_anyhow)?;
    Ok((StatusCode::ACCEPTED, Json(json!(backup))))
}

#[derive(Debug, Deserialize)]
pub struct TriggerRestorationRequest {
    pub backup_id: Uuid,
}

pub async fn trigger_restoration(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TriggerRestorationRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let restoration = trigger_installation_db_restoration(
        &state.store,
        &state.events,
        &InstallationId::new(&id),
        body.backup_id,
    )
    .await
    .map_err(ApiError::from_anyhow)?;
    Ok((StatusCode::ACCEPTED, Json(json!(restoration))))
}

#[derive(Debug, Deserialize)]
pub struct TriggerMigrationRequest {
    pub destination_database: String,
}

pub async fn trigger_migration(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TriggerMigrationRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let migration = trigger_installation_db_migration(
        &state.store,
        &state.events,
        &InstallationId::new(&id),
        &body.destination_database,
        state.max_database_weight,
    )
    .await
    .map_err(ApiError::from_anyhow)?;
    Ok((StatusCode::ACCEPTED, Json(json!(migration))))
}

// ── Multitenant databases ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterDatabaseRequest {
    /// Identifier of the shared database cluster, e.g. an RDS cluster id.
    pub id: String,
}

pub async fn register_database(
    State(state): State<AppState>,
    Json(body): Json<RegisterDatabaseRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let database = MultitenantDatabase::new(body.id, Utc::now());
    state.store.create_multitenant_database(&database).await?;
    Ok((StatusCode::CREATED, Json(json!(database))))
}

pub async fn get_database(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let database = state
        .store
        .get_multitenant_database(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("database '{id}' not found")))?;
    Ok(Json(json!(database)))
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub url: String,
    #[serde(default = "default_owner")]
    pub owner_id: String,
    #[serde(default = "default_failure_threshold_seconds")]
    pub failure_threshold_seconds: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_owner() -> String {
    "api".to_string()
}

fn default_failure_threshold_seconds() -> u64 {
    300
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Json(body): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut subscription = Subscription::new(
        body.url,
        EventType::ResourceStateChange,
        body.owner_id,
        chrono::Duration::seconds(body.failure_threshold_seconds as i64),
        Utc::now(),
    );
    subscription.headers = body.headers;
    state.store.create_subscription(&subscription).await?;
    Ok((StatusCode::CREATED, Json(json!(subscription))))
}

pub async fn list_subscriptions(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let subscriptions = state.store.list_subscriptions().await?;
    Ok(Json(json!(subscriptions)))
}

// ── Webhooks ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub owner_id: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

pub async fn create_webhook(
    State(state): State<AppState>,
    Json(body): Json<CreateWebhookRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut webhook = Webhook::new(body.owner_id, body.url, Utc::now());
    webhook.headers = body.headers;
    state.store.create_webhook(&webhook).await?;
    Ok((StatusCode::CREATED, Json(json!(webhook))))
}

pub async fn list_webhooks(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let webhooks = state.store.webhooks().await?;
    Ok(Json(json!(webhooks)))
}

pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_webhook(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    #[serde(default = "default_event_limit")]
    pub limit: usize,
    /// Restrict to one resource kind, e.g. `cluster` or `installation`.
    pub resource_type: Option<String>,
}

fn default_event_limit() -> usize {
    50
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let resource_type = query
        .resource_type
        .as_deref()
        .map(ResourceType::from_str)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let mut events = state.store.list_state_change_events(query.limit).await?;
    if let Some(resource_type) = resource_type {
        events.retain(|e| e.resource_type == resource_type);
    }
    Ok(Json(json!(events)))
}

pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let event = state
        .store
        .get_state_change_event(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("event '{id}' not found")))?;
    Ok(Json(json!(event)))
}
