use std::sync::Arc;

use parlance_events::EventProducer;
use parlance_store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub events: Arc<EventProducer>,
    /// Empty token disables auth (local mode).
    pub auth_token: Arc<String>,
    /// Capacity ceiling used when validating migration destinations.
    pub max_database_weight: f64,
}
