//! Pull-based peer registry synchronization.
//!
//! Hash-first: each round asks every peer for its state hash and only pulls
//! the full snapshot on mismatch. Merges write through the normal registry
//! API and never block local operations. Repeatedly failing peers are
//! quarantined.

mod client;

pub use client::{PeerClient, PEER_SECRET_HEADER};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mesh_core::config::SyncConfig;
use mesh_core::{metrics, Result};

use crate::registry::{MergeOutcome, ServiceRegistry};

/// What one peer round did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Hashes matched; nothing pulled, nothing mutated.
    InSync,
    /// Snapshot pulled and merged.
    Applied(MergeOutcome),
    /// Peer is quarantined; round skipped.
    Quarantined,
}

struct PeerState {
    url: String,
    consecutive_failures: u32,
    quarantined_until: Option<Instant>,
}

pub struct PeerSyncManager {
    registry: Arc<ServiceRegistry>,
    client: PeerClient,
    config: SyncConfig,
    peers: Vec<Mutex<PeerState>>,
}

impl PeerSyncManager {
    pub fn new(registry: Arc<ServiceRegistry>, config: SyncConfig) -> Result<Arc<Self>> {
        let client = PeerClient::new(
            &config.secret,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        let peers = config
            .peers
            .iter()
            .map(|url| {
                Mutex::new(PeerState {
                    url: url.clone(),
                    consecutive_failures: 0,
                    quarantined_until: None,
                })
            })
            .collect();

        Ok(Arc::new(Self {
            registry,
            client,
            config,
            peers,
        }))
    }

    /// Spawn the periodic sync loop.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let sync_interval = Duration::from_secs(self.config.interval_secs);

        tokio::spawn(async move {
            let mut timer = interval(sync_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Peer sync shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        manager.sync_round().await;
                    }
                }
            }
        })
    }

    /// One pass over every configured peer.
    pub async fn sync_round(&self) {
        for index in 0..self.peers.len() {
            let _ = self.sync_peer(index).await;
        }
    }

    /// Sync against one peer, with per-attempt retries and quarantine
    /// bookkeeping. Failures never propagate beyond metrics and logs.
    pub async fn sync_peer(&self, index: usize) -> SyncOutcome {
        let url = {
            let state = self.peers[index].lock();
            if let Some(until) = state.quarantined_until {
                if Instant::now() < until {
                    return SyncOutcome::Quarantined;
                }
            }
            state.url.clone()
        };

        match self.pull_with_retries(&url).await {
            Ok(outcome) => {
                let mut state = self.peers[index].lock();
                state.consecutive_failures = 0;
                state.quarantined_until = None;
                outcome
            }
            Err(e) => {
                warn!(peer = %url, error = %e, "Peer sync round failed");
                metrics::PEER_SYNC_FAILURES_TOTAL
                    .with_label_values(&[&url])
                    .inc();

                let mut state = self.peers[index].lock();
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_limit {
                    let quarantine = Duration::from_secs(self.config.quarantine_secs);
                    state.quarantined_until = Some(Instant::now() + quarantine);
                    state.consecutive_failures = 0;
                    warn!(
                        peer = %url,
                        quarantine_secs = self.config.quarantine_secs,
                        "Peer quarantined after repeated sync failures"
                    );
                }
                SyncOutcome::Quarantined
            }
        }
    }

    async fn pull_with_retries(&self, url: &str) -> Result<SyncOutcome> {
        let attempts = self.config.max_retries.max(1);
        let mut delay = Duration::from_millis(self.config.backoff_base_ms);
        let mut last_err = None;

        for attempt in 0..attempts {
            match self.pull_once(url).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    debug!(peer = url, attempt, error = %e, "Sync attempt failed");
                    last_err = Some(e);
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(last_err.unwrap_or_else(|| {
            mesh_core::Error::PeerUnreachable(format!("{url}: no attempts made"))
        }))
    }

    async fn pull_once(&self, url: &str) -> Result<SyncOutcome> {
        let remote_hash = self.client.fetch_hash(url).await?;
        if remote_hash == self.registry.state_hash() {
            debug!(peer = url, "State hashes match, skipping pull");
            return Ok(SyncOutcome::InSync);
        }

        let blob = self.client.fetch_state(url).await?;
        let outcome =
            self.registry
                .merge_remote(blob.instances, url, self.config.prefer_version);

        if outcome.changed() {
            info!(
                peer = url,
                inserted = outcome.inserted,
                updated = outcome.updated,
                conflicts = outcome.conflicts,
                "Peer sync applied"
            );
            self.registry.publish_sync_applied(url, outcome);
        }
        Ok(SyncOutcome::Applied(outcome))
    }

    /// Boot gate: wait up to `boot_grace_secs` for any peer to answer a hash
    /// request. Used when peers are mandatory.
    pub async fn await_any_peer(&self) -> bool {
        if self.peers.is_empty() {
            return true;
        }
        let deadline = Instant::now() + Duration::from_secs(self.config.boot_grace_secs);

        loop {
            for peer in &self.peers {
                let url = peer.lock().url.clone();
                if self.client.fetch_hash(&url).await.is_ok() {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    #[must_use]
    pub fn peer_urls(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.lock().url.clone()).collect()
    }
}
