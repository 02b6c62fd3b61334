//! Node runtime: wiring, startup order and reverse-order shutdown.
//!
//! Startup: registry (with optional snapshot restore), health engine,
//! resolver, peer sync, then the control API. Shutdown walks the same
//! chain backwards (peer sync, resolver, health engine, sweeper, registry
//! snapshot) under the configured deadline.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mesh_api::AppState;
use mesh_cluster::{
    CircuitBreakerRegistry, DnsResolver, HealthCheckEngine, PeerSyncManager, ResolutionEngine,
    ServiceRegistry, StrategySet, Sweeper,
};
use mesh_core::{MeshConfig, Strategy};

/// Startup/runtime failures mapped onto process exit codes.
#[derive(Debug)]
pub enum RunError {
    StateCorrupted(String),
    Bind(String),
    PeersUnreachable,
    Other(String),
}

impl RunError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StateCorrupted(_) => 3,
            Self::Bind(_) => 4,
            Self::PeersUnreachable => 5,
            Self::Other(_) => 1,
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StateCorrupted(msg) => write!(f, "state corrupted: {msg}"),
            Self::Bind(msg) => write!(f, "bind failed: {msg}"),
            Self::PeersUnreachable => write!(f, "mandatory peers unreachable within boot grace"),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

pub struct MeshServer {
    config: MeshConfig,
    node_id: String,
}

impl MeshServer {
    #[must_use]
    pub fn new(config: MeshConfig, node_id: String) -> Self {
        Self { config, node_id }
    }

    fn state_file(&self) -> Option<PathBuf> {
        if self.config.server.state_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.config.server.state_dir).join("registry.json"))
        }
    }

    pub async fn run(&self) -> Result<(), RunError> {
        // Registry first; everything else hangs off it.
        let registry = Arc::new(ServiceRegistry::new(self.config.registry.clone()));

        // Restore persisted state. Corruption is fatal: running with partial
        // state would poison every peer via sync.
        if let Some(path) = self.state_file() {
            match tokio::fs::read(&path).await {
                Ok(bytes) => match registry.restore(&bytes) {
                    Ok(count) => info!(path = %path.display(), instances = count, "State restored"),
                    Err(e) => return Err(RunError::StateCorrupted(e.to_string())),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    info!(path = %path.display(), "No persisted state, starting empty");
                }
                Err(e) => return Err(RunError::Other(format!("state read failed: {e}"))),
            }
        }

        let root_cancel = CancellationToken::new();
        let mut background = Vec::new();

        // Registry sweeper.
        let sweeper_cancel = root_cancel.child_token();
        background.push((
            "sweeper",
            Sweeper::start(registry.clone(), sweeper_cancel.clone()),
        ));

        // Health engine.
        let health = HealthCheckEngine::new(registry.clone(), self.config.health.clone());
        health.start();

        // Resolution stack.
        let dns = if self.config.resolver.servers.is_empty() {
            None
        } else {
            match DnsResolver::new(self.config.resolver.clone()).await {
                Ok(resolver) => Some(Arc::new(resolver)),
                Err(e) => {
                    warn!(error = %e, "DNS resolver unavailable, continuing registry-only");
                    None
                }
            }
        };
        let circuits = Arc::new(CircuitBreakerRegistry::new(self.config.circuit.clone()));
        let strategies = Arc::new(StrategySet::new(self.config.balance.clone()));
        let default_strategy = Strategy::from_name(&self.config.balance.default_strategy)
            .unwrap_or(Strategy::RoundRobin);
        let engine = ResolutionEngine::new(
            registry.clone(),
            dns,
            circuits,
            strategies,
            self.config.resolution.clone(),
            default_strategy,
        );
        let resolver_cancel = root_cancel.child_token();
        background.push((
            "resolver",
            engine.spawn_invalidation_task(resolver_cancel.clone()),
        ));

        // Peer sync. Mandatory peers gate startup behind the boot grace.
        let sync = PeerSyncManager::new(registry.clone(), self.config.sync.clone())
            .map_err(|e| RunError::Other(e.to_string()))?;
        if self.config.sync.mandatory && !sync.await_any_peer().await {
            return Err(RunError::PeersUnreachable);
        }
        let sync_cancel = root_cancel.child_token();
        if !self.config.sync.peers.is_empty() {
            background.push(("peer-sync", sync.start(sync_cancel.clone())));
            info!(peers = ?sync.peer_urls(), "Peer sync started");
        }

        // Periodic snapshot persistence.
        if let Some(path) = self.state_file() {
            if self.config.server.snapshot_interval_secs > 0 {
                let interval = Duration::from_secs(self.config.server.snapshot_interval_secs);
                let snapshot_registry = registry.clone();
                let snapshot_cancel = root_cancel.child_token();
                let snapshot_path = path.clone();
                background.push((
                    "snapshotter",
                    tokio::spawn(async move {
                        let mut timer = tokio::time::interval(interval);
                        loop {
                            tokio::select! {
                                () = snapshot_cancel.cancelled() => return,
                                _ = timer.tick() => {
                                    persist_snapshot(&snapshot_registry, &snapshot_path).await;
                                }
                            }
                        }
                    }),
                ));
            }
        }

        // Control API.
        let app_state = AppState {
            registry: registry.clone(),
            engine,
            health: health.clone(),
            peer_secret: self.config.sync.secret.clone(),
            compression_threshold: self.config.sync.compression_threshold_bytes,
        };
        let router = mesh_api::create_router(app_state);

        let listener = tokio::net::TcpListener::bind(&self.config.server.bind_addr)
            .await
            .map_err(|e| RunError::Bind(format!("{}: {e}", self.config.server.bind_addr)))?;
        info!(
            node_id = %self.node_id,
            addr = %self.config.server.bind_addr,
            datacenter = %self.config.server.datacenter,
            "Control API listening"
        );

        let serve_cancel = root_cancel.child_token();
        let graceful = async move { serve_cancel.cancelled().await };
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .into_future();

        tokio::select! {
            result = serve => {
                if let Err(e) = result {
                    error!(error = %e, "Control API server error");
                }
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown");
            }
        }

        // Reverse dependency order: peer sync, resolver, health engine,
        // sweeper, then the final snapshot.
        let deadline = Duration::from_secs(self.config.server.shutdown_deadline_secs);
        sync_cancel.cancel();
        resolver_cancel.cancel();
        health.shutdown().await;
        sweeper_cancel.cancel();
        root_cancel.cancel();

        for (name, handle) in background {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!(task = name, "Background task exceeded shutdown deadline, abandoning");
            }
        }

        if let Some(path) = self.state_file() {
            persist_snapshot(&registry, &path).await;
        }

        Ok(())
    }
}

/// Write the registry snapshot atomically (temp file + rename).
async fn persist_snapshot(registry: &ServiceRegistry, path: &std::path::Path) {
    let blob = match registry.snapshot() {
        Ok(blob) => blob,
        Err(e) => {
            error!(error = %e, "Snapshot serialization failed");
            return;
        }
    };

    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            error!(error = %e, "Could not create state directory");
            return;
        }
    }

    let tmp = path.with_extension("json.tmp");
    if let Err(e) = tokio::fs::write(&tmp, &blob).await {
        error!(error = %e, "Snapshot write failed");
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        error!(error = %e, "Snapshot rename failed");
        return;
    }
    info!(path = %path.display(), bytes = blob.len(), "Registry snapshot persisted");
}

/// Wait for SIGTERM or SIGINT/Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
