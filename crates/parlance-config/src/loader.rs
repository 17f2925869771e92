use std::path::Path;

use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{Config, StoreKind};

/// Load and validate the control-plane config file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let config: Config = serde_yaml::from_str(&content)?;
    debug!("loaded config from {}", path.display());
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.store.kind == StoreKind::Postgres && config.store.postgres_url.is_none() {
        return Err(ConfigError::Invalid(
            "store.postgres_url is required when store.kind is postgres".to_string(),
        ));
    }
    if config.databases.max_installation_weight <= 0.0 {
        return Err(ConfigError::Invalid(
            "databases.max_installation_weight must be positive".to_string(),
        ));
    }
    Ok(())
}
