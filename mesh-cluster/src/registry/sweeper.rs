//! Background expiry sweeper.
//!
//! Instances whose heartbeat is older than the TTL are forced `UNHEALTHY`;
//! after a further expiry grace they are removed entirely.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mesh_core::ServiceStatus;

use super::ServiceRegistry;

pub struct Sweeper;

impl Sweeper {
    /// Spawn the sweep loop. Returns the `JoinHandle` so the caller can
    /// await shutdown; cancel via the token.
    pub fn start(
        registry: Arc<ServiceRegistry>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cleanup_interval = Duration::from_secs(registry.config().cleanup_interval_secs);

        tokio::spawn(async move {
            let mut timer = interval(cleanup_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Registry sweeper shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        Self::sweep_once(&registry);
                    }
                }
            }
        })
    }

    /// One sweep pass over every instance.
    pub fn sweep_once(registry: &ServiceRegistry) {
        let ttl = i64::try_from(registry.config().ttl_secs).unwrap_or(i64::MAX);
        let expiry = ttl.saturating_add(
            i64::try_from(registry.config().expiry_grace_secs).unwrap_or(i64::MAX),
        );
        let now = Utc::now();

        for instance in registry.all_instances() {
            let age = now
                .signed_duration_since(instance.last_heartbeat_at)
                .num_seconds();

            if age > expiry {
                registry.evict(&instance.instance_id, "expired");
                continue;
            }

            if age > ttl
                && !matches!(
                    instance.status,
                    ServiceStatus::Unhealthy | ServiceStatus::Stopping | ServiceStatus::Stopped
                )
            {
                if let Err(e) =
                    registry.update_status(&instance.instance_id, ServiceStatus::Unhealthy)
                {
                    warn!(
                        instance_id = %instance.instance_id,
                        error = %e,
                        "Failed to mark stale instance unhealthy"
                    );
                } else {
                    warn!(
                        instance_id = %instance.instance_id,
                        age_secs = age,
                        "Instance marked unhealthy: heartbeat expired"
                    );
                }
            }
        }
    }
}
