mod loader;
mod raw;
pub mod error;

pub use error::ConfigError;
pub use loader::load_config;
pub use raw::{
    ApiConfig, Config, DatabasesConfig, EventsConfig, StoreConfig, StoreKind,
    SupervisorCadence, SupervisorsConfig,
};
