//! HTTP API - JSON endpoints over the lifecycle manager

mod error;
mod handlers;

use std::sync::Arc;

use axum::routing::{delete, get};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::core::LifecycleManager;

pub use error::ApiError;
pub use handlers::{CreateInstanceRequest, InstanceActionResponse};

pub type AppState = Arc<LifecycleManager>;

pub fn build_router(manager: Arc<LifecycleManager>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/api/status", get(handlers::status))
        .route("/api/engines", get(handlers::list_engines))
        .route("/api/aircraft", get(handlers::list_engines))
        .route(
            "/api/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/api/instances/{id}",
            get(handlers::get_instance).delete(handlers::stop_instance),
        )
        .route("/api/instances/{id}/record", delete(handlers::remove_instance))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}
