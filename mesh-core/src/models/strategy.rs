//! Load-balancing strategy tags.
//!
//! The selection state (counters, rings, adaptive controller) lives in the
//! cluster crate; this is the wire-level tag callers pass to resolve.

use serde::{Deserialize, Serialize};

/// Selection algorithm for one resolve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    PowerOfTwo,
    WeightedRandom,
    ConsistentHash,
    ResourceAware,
    Adaptive,
    /// Same-region preference applied before the fallback strategy.
    Nearest,
}

impl Strategy {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastConnections => "least_connections",
            Self::PowerOfTwo => "power_of_two",
            Self::WeightedRandom => "weighted_random",
            Self::ConsistentHash => "consistent_hash",
            Self::ResourceAware => "resource_aware",
            Self::Adaptive => "adaptive",
            Self::Nearest => "nearest",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "round_robin" => Some(Self::RoundRobin),
            "weighted_round_robin" => Some(Self::WeightedRoundRobin),
            "least_connections" => Some(Self::LeastConnections),
            "power_of_two" => Some(Self::PowerOfTwo),
            "weighted_random" => Some(Self::WeightedRandom),
            "consistent_hash" => Some(Self::ConsistentHash),
            "resource_aware" => Some(Self::ResourceAware),
            "adaptive" => Some(Self::Adaptive),
            "nearest" => Some(Self::Nearest),
            _ => None,
        }
    }
}

/// Every recognized strategy name, for config validation and docs.
#[must_use]
pub const fn strategy_names() -> &'static [&'static str] {
    &[
        "round_robin",
        "weighted_round_robin",
        "least_connections",
        "power_of_two",
        "weighted_random",
        "consistent_hash",
        "resource_aware",
        "adaptive",
        "nearest",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for name in strategy_names() {
            let strategy = Strategy::from_name(name).unwrap();
            assert_eq!(strategy.name(), *name);
        }
        assert!(Strategy::from_name("fanciest_first").is_none());
    }

    #[test]
    fn test_serde_tags() {
        let json = serde_json::to_string(&Strategy::PowerOfTwo).unwrap();
        assert_eq!(json, "\"power_of_two\"");
        let back: Strategy = serde_json::from_str("\"consistent_hash\"").unwrap();
        assert_eq!(back, Strategy::ConsistentHash);
    }
}
