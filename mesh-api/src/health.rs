//! Liveness and metrics endpoints.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use mesh_core::metrics;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// GET /healthz
pub async fn liveness() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
        }),
    )
}

/// GET /metrics
pub async fn prometheus_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::encode_text(),
    )
}
