//! Service listing.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use mesh_core::{InstanceFilter, ServiceInstance};

use crate::{AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Comma-separated required tags.
    #[serde(default)]
    pub tag: Option<String>,
    /// Exact version match.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub min_health: Option<f64>,
}

impl ListQuery {
    fn into_filter(self) -> InstanceFilter {
        InstanceFilter {
            tags: self
                .tag
                .map(|tags| {
                    tags.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            min_version: self.version.clone(),
            max_version: self.version,
            region: self.region,
            min_health: self.min_health,
        }
    }
}

/// GET /registry/services/{name}
pub async fn list(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<ServiceInstance>>> {
    let filter = query.into_filter();
    Ok(Json(state.registry.list(&name, &filter)))
}
