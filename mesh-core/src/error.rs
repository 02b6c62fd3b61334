//! Error types shared across the mesh

use thiserror::Error;

/// Mesh error taxonomy.
///
/// Every public operation returns one of these; background tasks log and
/// count their failures instead of letting them escape.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate instance: {0}")]
    DuplicateInstance(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("No candidates for service '{0}'")]
    NoCandidates(String),

    #[error("No DNS resolution for '{0}'")]
    NoResolution(String),

    #[error("Circuit open for {service}/{instance_id}")]
    CircuitOpen {
        service: String,
        instance_id: String,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("State corrupted: {0}")]
    StateCorruption(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short stable label used as a metric `reason` value.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::DuplicateInstance(_) => "duplicate_instance",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NoCandidates(_) => "no_candidates",
            Self::NoResolution(_) => "no_resolution",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::PeerUnreachable(_) => "peer_unreachable",
            Self::StateCorruption(_) => "state_corruption",
            Self::Configuration(_) => "configuration",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

/// Result type for mesh operations
pub type Result<T> = std::result::Result<T, Error>;
