//! Instance lifecycle endpoints.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use mesh_core::{ServiceInstance, ServiceStatus};
use mesh_cluster::{ProbeKind, ProbeSpec};

use crate::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub instance_id: String,
    pub service_name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional health probe registered together with the instance.
    #[serde(default)]
    pub probe: Option<ProbeSpec>,
}

/// POST /registry/instances
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> AppResult<impl IntoResponse> {
    let mut instance = ServiceInstance::new(
        &request.instance_id,
        &request.service_name,
        &request.address,
        request.port,
    );
    if let Some(weight) = request.weight {
        instance.weight = weight;
    }
    instance.metadata = request.metadata;
    instance.region = request.region.unwrap_or_default();
    instance.version = request.version.unwrap_or_default();
    instance.tags = request.tags.into_iter().collect();

    let probe = request.probe.or_else(|| {
        // Default to a TCP probe against the advertised endpoint.
        Some(ProbeSpec::with_defaults(
            ProbeKind::Tcp {
                host: instance.address.clone(),
                port: instance.port,
            },
            &mesh_core::config::HealthConfig::default(),
        ))
    });

    let stored = state.registry.register(instance)?;
    if let Some(probe) = probe {
        state.health.submit(&stored.instance_id, probe);
    }

    Ok((StatusCode::CREATED, Json(stored)))
}

/// POST /registry/instances/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.registry.heartbeat(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub status: Option<ServiceStatus>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// PATCH /registry/instances/{id}
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> AppResult<Json<ServiceInstance>> {
    if request.status.is_none() && request.metadata.is_none() {
        return Err(AppError::bad_request(
            "patch must set status and/or metadata",
        ));
    }

    if let Some(status) = request.status {
        state.registry.update_status(&id, status)?;
    }
    if let Some(patch) = request.metadata {
        state.registry.update_metadata(&id, patch)?;
    }

    state
        .registry
        .get(&id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("instance '{id}'")))
}

#[derive(Debug, Deserialize)]
pub struct DeregisterQuery {
    #[serde(default)]
    pub reason: Option<String>,
}

/// DELETE /registry/instances/{id}
pub async fn deregister(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeregisterQuery>,
) -> AppResult<StatusCode> {
    let reason = query.reason.unwrap_or_else(|| "deregistered".to_string());
    state.registry.deregister(&id, &reason)?;
    // Accepted: removal completes after the grace period.
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct OutcomeRequest {
    pub success: bool,
}

/// POST /registry/instances/{id}/report
///
/// Call-outcome feedback driving the per-target circuit breaker.
pub async fn report_outcome(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<OutcomeRequest>,
) -> AppResult<StatusCode> {
    let service = state
        .registry
        .service_of(&id)
        .ok_or_else(|| AppError::not_found(format!("instance '{id}'")))?;
    state.engine.report_outcome(&service, &id, request.success);
    Ok(StatusCode::NO_CONTENT)
}
