pub mod backup;
pub mod cluster;
pub mod cluster_installation;
pub mod error;
pub mod import;
pub mod installation;
pub mod migration;
pub mod restoration;
pub mod scheduler;
pub mod supervisor;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testutil;

pub use backup::BackupSupervisor;
pub use cluster::ClusterSupervisor;
pub use cluster_installation::ClusterInstallationSupervisor;
pub use error::SupervisorError;
pub use import::ImportSupervisor;
pub use installation::InstallationSupervisor;
pub use migration::MigrationSupervisor;
pub use restoration::RestorationSupervisor;
pub use scheduler::Scheduler;
pub use supervisor::Supervisor;
pub use trigger::{
    ensure_installation_ready_for_db_restoration, trigger_installation_backup,
    trigger_installation_db_migration, trigger_installation_db_restoration,
    validate_db_migration_destination,
};
