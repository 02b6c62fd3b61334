//! HTTP client side of peer synchronization.

use std::io::Read;
use std::time::Duration;

use flate2::read::ZlibDecoder;
use serde::Deserialize;
use tracing::debug;

use mesh_core::{Error, Result};

use crate::registry::{snapshot_decode, SnapshotBlob};

/// Shared-secret header carried on every peer request and checked by the
/// state endpoints.
pub const PEER_SECRET_HEADER: &str = "x-mesh-secret";

/// Upper bound on a sync payload, before and after inflation. A peer that
/// advertises more state than this is misbehaving.
const MAX_SYNC_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct StateHashResponse {
    hash: String,
}

pub struct PeerClient {
    http: reqwest::Client,
    secret: String,
}

impl PeerClient {
    pub fn new(secret: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("peer client build failed: {e}")))?;
        Ok(Self {
            http,
            secret: secret.to_string(),
        })
    }

    /// Ask a peer for its current registry state hash.
    pub async fn fetch_hash(&self, base_url: &str) -> Result<String> {
        let url = format!("{}/registry/state/hash", base_url.trim_end_matches('/'));
        let response = self
            .request(&url)
            .send()
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{base_url}: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::PeerUnreachable(format!(
                "{base_url}: hash endpoint returned {}",
                response.status()
            )));
        }

        let body: StateHashResponse = response
            .json()
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{base_url}: bad hash body: {e}")))?;
        Ok(body.hash)
    }

    /// Fetch and validate a peer's full snapshot. Bodies the peer compressed
    /// (content-encoding: deflate) are inflated before decoding.
    pub async fn fetch_state(&self, base_url: &str) -> Result<SnapshotBlob> {
        let url = format!("{}/registry/state", base_url.trim_end_matches('/'));
        let response = self
            .request(&url)
            .send()
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{base_url}: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::PeerUnreachable(format!(
                "{base_url}: state endpoint returned {}",
                response.status()
            )));
        }

        let compressed = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("deflate"));

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{base_url}: body read failed: {e}")))?;
        if body.len() > MAX_SYNC_BODY_BYTES {
            return Err(Error::PeerUnreachable(format!(
                "{base_url}: sync body of {} bytes exceeds the transfer bound",
                body.len()
            )));
        }

        let bytes = if compressed {
            debug!(peer = base_url, compressed_len = body.len(), "Inflating sync payload");
            let mut decoder = ZlibDecoder::new(body.as_ref()).take(MAX_SYNC_BODY_BYTES as u64);
            let mut inflated = Vec::new();
            decoder.read_to_end(&mut inflated).map_err(|e| {
                Error::StateCorruption(format!("peer payload failed to inflate: {e}"))
            })?;
            inflated
        } else {
            body.to_vec()
        };

        // decode() verifies schema, ordering and the embedded hash, so a
        // tampered or truncated payload never reaches the merge.
        snapshot_decode(&bytes)
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.get(url);
        if !self.secret.is_empty() {
            builder = builder.header(PEER_SECRET_HEADER, &self.secret);
        }
        builder
    }
}
