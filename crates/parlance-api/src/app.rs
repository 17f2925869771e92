use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use parlance_events::EventProducer;
use parlance_store::Store;
use tower_http::trace::TraceLayer;

use crate::auth::require_bearer_token;
use crate::handlers;
use crate::state::AppState;

pub fn build_app(
    store: Arc<dyn Store>,
    events: Arc<EventProducer>,
    auth_token: Arc<String>,
    max_database_weight: f64,
) -> Router {
    let state = AppState { store, events, auth_token, max_database_weight };

    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        // Clusters
        .route(
            "/clusters",
            get(handlers::list_clusters).post(handlers::create_cluster),
        )
        .route("/clusters/:id", get(handlers::get_cluster))
        // Installations
        .route(
            "/installations",
            get(handlers::list_installations).post(handlers::create_installation),
        )
        .route(
            "/installations/:id",
            get(handlers::get_installation).delete(handlers::delete_installation),
        )
        .route("/installations/:id/hibernate", post(handlers::hibernate_installation))
        .route("/installations/:id/wake-up", post(handlers::wake_up_installation))
        // Lifecycle operations
        .route("/installations/:id/backups", post(handlers::trigger_backup))
        .route("/installations/:id/restorations", post(handlers::trigger_restoration))
        .route("/installations/:id/migrations", post(handlers::trigger_migration))
        // Multitenant databases
        .route("/databases", post(handlers::register_database))
        .route("/databases/:id", get(handlers::get_database))
        // Subscriptions
        .route(
            "/subscriptions",
            get(handlers::list_subscriptions).post(handlers::create_subscription),
        )
        // Webhooks
        .route(
            "/webhooks",
            get(handlers::list_webhooks).post(handlers::create_webhook),
        )
        .route("/webhooks/:id", axum::routing::delete(handlers::delete_webhook))
        // Events
        .route("/events", get(handlers::list_events))
        .route("/events/:id", get(handlers::get_event))
        // Auth middleware applies to all routes above
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
