//! HTTP/JSON control API for a mesh node.
//!
//! Registration, heartbeats, listing, resolution, peer state exchange, an
//! SSE event stream and Prometheus metrics, served by one axum router.

pub mod error;
pub mod events;
pub mod health;
pub mod instances;
pub mod resolve;
pub mod services;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, patch, post},
    Router,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use mesh_cluster::{HealthCheckEngine, ResolutionEngine, ServiceRegistry};

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
    pub engine: Arc<ResolutionEngine>,
    pub health: Arc<HealthCheckEngine>,
    /// Shared secret required on peer state endpoints. Empty disables the
    /// check.
    pub peer_secret: String,
    /// Snapshot bodies at or above this size are served zlib-compressed.
    pub compression_threshold: usize,
}

/// Build the control API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/registry/instances", post(instances::register))
        .route(
            "/registry/instances/{id}/heartbeat",
            post(instances::heartbeat),
        )
        .route(
            "/registry/instances/{id}/report",
            post(instances::report_outcome),
        )
        .route(
            "/registry/instances/{id}",
            patch(instances::update).delete(instances::deregister),
        )
        .route("/registry/services/{name}", get(services::list))
        .route("/registry/state", get(state::snapshot))
        .route("/registry/state/hash", get(state::state_hash))
        .route("/resolve", post(resolve::resolve))
        .route("/events", get(events::stream))
        .route("/healthz", get(health::liveness))
        .route("/metrics", get(health::prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}
