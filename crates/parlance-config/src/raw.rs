use serde::{Deserialize, Serialize};

/// Control-plane configuration, loaded from a single YAML file.
/// Every field has a default so a missing file means "local mode".
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub supervisors: SupervisorsConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub databases: DatabasesConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_kind")]
    pub kind: StoreKind,
    /// Required when `kind` is `postgres`.
    pub postgres_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig { kind: StoreKind::Memory, postgres_url: None }
    }
}

fn default_store_kind() -> StoreKind {
    StoreKind::Memory
}

/// Tick cadence and per-tick concurrency of one supervisor.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct SupervisorCadence {
    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for SupervisorCadence {
    fn default() -> Self {
        SupervisorCadence { poll_seconds: default_poll_seconds(), concurrency: default_concurrency() }
    }
}

fn default_poll_seconds() -> u64 {
    15
}

fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SupervisorsConfig {
    #[serde(default)]
    pub cluster: SupervisorCadence,
    #[serde(default)]
    pub installation: SupervisorCadence,
    #[serde(default)]
    pub cluster_installation: SupervisorCadence,
    #[serde(default)]
    pub backup: SupervisorCadence,
    #[serde(default)]
    pub restoration: SupervisorCadence,
    #[serde(default)]
    pub migration: SupervisorCadence,
    #[serde(default)]
    pub import: SupervisorCadence,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    #[serde(default = "default_up_to_date_workers")]
    pub up_to_date_workers: usize,
    #[serde(default = "default_retry_workers")]
    pub retry_workers: usize,
    #[serde(default = "default_max_burst_workers")]
    pub max_burst_workers: usize,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_worker_idle_delay_millis")]
    pub worker_idle_delay_millis: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        EventsConfig {
            up_to_date_workers: default_up_to_date_workers(),
            retry_workers: default_retry_workers(),
            max_burst_workers: default_max_burst_workers(),
            retry_delay_seconds: default_retry_delay_seconds(),
            worker_idle_delay_millis: default_worker_idle_delay_millis(),
        }
    }
}

fn default_up_to_date_workers() -> usize {
    2
}

fn default_retry_workers() -> usize {
    2
}

fn default_max_burst_workers() -> usize {
    50
}

fn default_retry_delay_seconds() -> u64 {
    20
}

fn default_worker_idle_delay_millis() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on every API request.
    pub auth_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig { bind: default_bind(), auth_token: None }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8075".to_string()
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct DatabasesConfig {
    /// Maximum summed installation weight a shared database cluster accepts.
    #[serde(default = "default_max_installation_weight")]
    pub max_installation_weight: f64,
}

impl Default for DatabasesConfig {
    fn default() -> Self {
        DatabasesConfig { max_installation_weight: default_max_installation_weight() }
    }
}

fn default_max_installation_weight() -> f64 {
    10.0
}
