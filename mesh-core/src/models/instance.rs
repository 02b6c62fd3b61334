//! Service instances and their lifecycle states.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a service instance.
///
/// The allowed graph is `Starting -> Running -> Stopping -> Stopped`, with
/// `Unhealthy` reachable from every live state (and recoverable back to
/// `Running` by the health engine). `Unknown` means the instance has never
/// been observed. Only `Running` instances are eligible for resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Unhealthy,
    Unknown,
}

impl ServiceStatus {
    /// Whether the lifecycle graph permits moving from `self` to `next`.
    /// Same-state transitions are permitted (idempotent updates).
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            // Stopped is terminal.
            (Self::Stopped, _) => false,
            // Any live state may degrade.
            (_, Self::Unhealthy) => true,
            (Self::Starting, Self::Running | Self::Stopping) => true,
            (Self::Running, Self::Stopping) => true,
            (Self::Stopping, Self::Stopped) => true,
            // Health engine recovery, or deregistration of a sick instance.
            (Self::Unhealthy, Self::Running | Self::Stopping) => true,
            (Self::Unknown, Self::Starting | Self::Running) => true,
            _ => false,
        }
    }

    /// Only `Running` instances are handed out by the resolver.
    #[must_use]
    pub const fn is_resolvable(self) -> bool {
        matches!(self, Self::Running)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Unhealthy => "UNHEALTHY",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressable replica of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub service_name: String,
    pub address: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Ordered so snapshot serialization is byte-stable across nodes.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default = "default_status")]
    pub status: ServiceStatus,
    #[serde(default = "default_health_score")]
    pub health_score: f64,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub active_connections: u32,
}

fn default_weight() -> u32 {
    1
}

fn default_status() -> ServiceStatus {
    ServiceStatus::Unknown
}

fn default_health_score() -> f64 {
    0.5
}

impl ServiceInstance {
    #[must_use]
    pub fn new(instance_id: &str, service_name: &str, address: &str, port: u16) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.to_string(),
            service_name: service_name.to_string(),
            address: address.to_string(),
            port,
            weight: 1,
            metadata: BTreeMap::new(),
            status: ServiceStatus::Starting,
            health_score: 0.5,
            region: String::new(),
            version: String::new(),
            tags: BTreeSet::new(),
            registered_at: now,
            last_heartbeat_at: now,
            active_connections: 0,
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    #[must_use]
    pub fn with_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// "host:port" endpoint string.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Whether the last heartbeat is older than `ttl_secs`.
    #[must_use]
    pub fn is_stale(&self, ttl_secs: i64) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_heartbeat_at);
        elapsed.num_seconds() > ttl_secs
    }

    /// A resource metric reported via `metadata`, clamped to `[0,1]`.
    /// Missing or unparsable values default to 0.5.
    #[must_use]
    pub fn resource_metric(&self, key: &str) -> f64 {
        self.metadata
            .get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .map_or(0.5, |v| v.clamp(0.0, 1.0))
    }
}

/// Caller-supplied context for a single resolve call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientContext {
    /// Region of the caller, used by the NEAREST strategy.
    #[serde(default)]
    pub region: Option<String>,
    /// Affinity key, required by the CONSISTENT_HASH strategy.
    #[serde(default)]
    pub hash_key: Option<String>,
}
