pub mod backup;
pub mod cluster;
pub mod cluster_installation;
pub mod database;
pub mod error;
pub mod event;
pub mod installation;
pub mod migration;
pub mod status;
pub mod types;

mod tests;

pub use backup::{BackupState, DataResidence, InstallationBackup};
pub use cluster::{
    Cluster, ClusterState, EksMetadata, KopsMetadata, ProvisionerKind, ProvisionerMetadata,
    UtilityVersions,
};
pub use cluster_installation::{ClusterInstallation, ClusterInstallationState};
pub use database::MultitenantDatabase;
pub use error::DomainError;
pub use event::{
    DeliveryStatus, EventDelivery, EventDeliveryData, EventPayload, EventType, StateChangeEvent,
    Subscription, SubscriptionDeliveryStatus, Webhook, WebhookPayload,
};
pub use installation::{
    DatabaseKind, FilestoreKind, Installation, InstallationSize, InstallationState,
};
pub use migration::{
    InstallationDbMigration, InstallationDbRestoration, MigrationState, RestorationState,
};
pub use status::{status_code, status_error, with_status, wrap_with_status, StatusError};
pub use types::{
    ClusterId, ClusterInstallationId, InstallationId, Lease, ResourceType, Warning,
};
