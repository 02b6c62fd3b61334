//! Registry events delivered to subscribers and the SSE stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::instance::ServiceStatus;

/// Events published by the registry.
///
/// Delivery is at-least-once and ordered per subscriber; see the registry's
/// subscription API for queueing semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// A new instance entered the registry.
    Registered {
        service: String,
        instance_id: String,
        timestamp: DateTime<Utc>,
    },

    /// An instance moved along the lifecycle graph.
    StatusChanged {
        service: String,
        instance_id: String,
        from: ServiceStatus,
        to: ServiceStatus,
        timestamp: DateTime<Utc>,
    },

    /// Instance metadata was patched.
    MetadataUpdated {
        service: String,
        instance_id: String,
        timestamp: DateTime<Utc>,
    },

    /// An instance left the registry.
    Deregistered {
        service: String,
        instance_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A peer sync round applied changes to the local registry.
    SyncApplied {
        peer: String,
        inserted: usize,
        updated: usize,
        conflicts: usize,
        timestamp: DateTime<Utc>,
    },
}

impl RegistryEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::StatusChanged { .. } => "status_changed",
            Self::MetadataUpdated { .. } => "metadata_updated",
            Self::Deregistered { .. } => "deregistered",
            Self::SyncApplied { .. } => "sync_applied",
        }
    }

    /// Service the event belongs to, if any.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::Registered { service, .. }
            | Self::StatusChanged { service, .. }
            | Self::MetadataUpdated { service, .. }
            | Self::Deregistered { service, .. } => Some(service),
            Self::SyncApplied { .. } => None,
        }
    }

    /// Instance the event belongs to, if any.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::Registered { instance_id, .. }
            | Self::StatusChanged { instance_id, .. }
            | Self::MetadataUpdated { instance_id, .. }
            | Self::Deregistered { instance_id, .. } => Some(instance_id),
            Self::SyncApplied { .. } => None,
        }
    }

    #[must_use]
    pub const fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Registered { timestamp, .. }
            | Self::StatusChanged { timestamp, .. }
            | Self::MetadataUpdated { timestamp, .. }
            | Self::Deregistered { timestamp, .. }
            | Self::SyncApplied { timestamp, .. } => timestamp,
        }
    }

    /// Whether the event changes which instances a resolve call may return.
    /// Used to invalidate resolution caches.
    #[must_use]
    pub const fn affects_resolution(&self) -> bool {
        matches!(
            self,
            Self::Registered { .. } | Self::StatusChanged { .. } | Self::Deregistered { .. }
        )
    }
}
