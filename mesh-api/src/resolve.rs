//! Resolution endpoint.

use axum::{extract::State, Json};
use serde::Deserialize;

use mesh_core::{ClientContext, InstanceFilter, ServiceInstance, Strategy};

use crate::{AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub service: String,
    #[serde(default)]
    pub filter: InstanceFilter,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub client_context: ClientContext,
}

/// POST /resolve
pub async fn resolve(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> AppResult<Json<ServiceInstance>> {
    let instance = state
        .engine
        .resolve(
            &request.service,
            &request.filter,
            request.strategy,
            &request.client_context,
        )
        .await?;
    Ok(Json(instance))
}
