//! Peer state exchange endpoints.
//!
//! These serve the snapshot blob and its hash for pull-based peer sync.
//! When a peer secret is configured, both endpoints require it via the
//! `x-mesh-secret` header (constant-time comparison).

use std::io::Write;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use subtle::ConstantTimeEq;

use mesh_cluster::PEER_SECRET_HEADER;

use crate::{AppError, AppResult, AppState};

#[derive(Debug, Serialize)]
pub struct StateHashResponse {
    pub hash: String,
}

/// GET /registry/state/hash
pub async fn state_hash(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<StateHashResponse>> {
    check_peer_secret(&state, &headers)?;
    Ok(Json(StateHashResponse {
        hash: state.registry.state_hash(),
    }))
}

/// GET /registry/state
///
/// Serves the canonical snapshot blob, zlib-compressed once it crosses the
/// configured threshold.
pub async fn snapshot(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    check_peer_secret(&state, &headers)?;

    let blob = state.registry.snapshot()?;
    if blob.len() >= state.compression_threshold {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&blob)
            .map_err(|e| AppError::internal(format!("snapshot compression failed: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| AppError::internal(format!("snapshot compression failed: {e}")))?;
        Ok((
            StatusCode::OK,
            [
                (header::CONTENT_ENCODING, "deflate"),
                (header::CONTENT_TYPE, "application/json"),
            ],
            compressed,
        )
            .into_response())
    } else {
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            blob,
        )
            .into_response())
    }
}

fn check_peer_secret(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    if state.peer_secret.is_empty() {
        return Ok(());
    }
    let presented = headers
        .get(PEER_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if presented
        .as_bytes()
        .ct_eq(state.peer_secret.as_bytes())
        .into()
    {
        Ok(())
    } else {
        Err(AppError::unauthorized("peer secret missing or invalid"))
    }
}
