//! Canonical snapshot blobs.
//!
//! The payload is the instance list sorted by `instance_id`, serialized as
//! JSON with ordered maps throughout, so equal states hash to equal bytes on
//! every node. The header carries the schema version and the payload hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use mesh_core::{Error, Result, ServiceInstance};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub state_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotBlob {
    pub header: SnapshotHeader,
    pub instances: Vec<ServiceInstance>,
}

/// SHA-256 over the canonical payload bytes, hex-encoded.
/// Callers must pass the list already sorted by `instance_id`.
#[must_use]
pub fn canonical_hash(instances: &[ServiceInstance]) -> String {
    let bytes = match serde_json::to_vec(instances) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize registry state for hashing");
            return String::new();
        }
    };
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

/// Serialize a snapshot blob. The instance list must already be in canonical
/// order.
pub fn encode(instances: Vec<ServiceInstance>) -> Result<Vec<u8>> {
    let blob = SnapshotBlob {
        header: SnapshotHeader {
            schema_version: SCHEMA_VERSION,
            created_at: Utc::now(),
            state_hash: canonical_hash(&instances),
        },
        instances,
    };
    Ok(serde_json::to_vec(&blob)?)
}

/// Parse and validate a snapshot blob.
///
/// Rejects unknown schema versions, hash mismatches, out-of-order or
/// duplicate instance ids; any of these means the blob cannot be trusted.
pub fn decode(bytes: &[u8]) -> Result<SnapshotBlob> {
    let blob: SnapshotBlob = serde_json::from_slice(bytes)
        .map_err(|e| Error::StateCorruption(format!("snapshot blob unparsable: {e}")))?;

    if blob.header.schema_version != SCHEMA_VERSION {
        return Err(Error::StateCorruption(format!(
            "unsupported snapshot schema version {}",
            blob.header.schema_version
        )));
    }

    for pair in blob.instances.windows(2) {
        if pair[0].instance_id >= pair[1].instance_id {
            return Err(Error::StateCorruption(
                "snapshot instances are not in canonical order".to_string(),
            ));
        }
    }

    let actual = canonical_hash(&blob.instances);
    if actual != blob.header.state_hash {
        return Err(Error::StateCorruption(format!(
            "snapshot hash mismatch: header {} vs payload {}",
            blob.header.state_hash, actual
        )));
    }

    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted_instances() -> Vec<ServiceInstance> {
        vec![
            ServiceInstance::new("a1", "auth", "10.0.0.1", 8080),
            ServiceInstance::new("a2", "auth", "10.0.0.2", 8080),
        ]
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let instances = sorted_instances();
        let hash = canonical_hash(&instances);

        let bytes = encode(instances).unwrap();
        let blob = decode(&bytes).unwrap();
        assert_eq!(blob.header.schema_version, SCHEMA_VERSION);
        assert_eq!(blob.header.state_hash, hash);
        assert_eq!(blob.instances.len(), 2);
    }

    #[test]
    fn test_equal_states_hash_equal() {
        // Same values, independently constructed maps: the canonical
        // serialization must produce identical hashes.
        let mut a = sorted_instances();
        a[0].metadata.insert("zone".to_string(), "a".to_string());
        a[0].metadata.insert("cpu".to_string(), "0.5".to_string());

        let mut b = sorted_instances();
        b[0].metadata.insert("cpu".to_string(), "0.5".to_string());
        b[0].metadata.insert("zone".to_string(), "a".to_string());
        b[0].registered_at = a[0].registered_at;
        b[0].last_heartbeat_at = a[0].last_heartbeat_at;
        b[1].registered_at = a[1].registered_at;
        b[1].last_heartbeat_at = a[1].last_heartbeat_at;

        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn test_decode_rejects_unordered() {
        let mut instances = sorted_instances();
        instances.reverse();
        let blob = SnapshotBlob {
            header: SnapshotHeader {
                schema_version: SCHEMA_VERSION,
                created_at: Utc::now(),
                state_hash: canonical_hash(&instances),
            },
            instances,
        };
        let bytes = serde_json::to_vec(&blob).unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::StateCorruption(_)));
    }

    #[test]
    fn test_decode_rejects_wrong_schema() {
        let instances = sorted_instances();
        let blob = SnapshotBlob {
            header: SnapshotHeader {
                schema_version: 99,
                created_at: Utc::now(),
                state_hash: canonical_hash(&instances),
            },
            instances,
        };
        let bytes = serde_json::to_vec(&blob).unwrap();
        assert!(matches!(
            decode(&bytes).unwrap_err(),
            Error::StateCorruption(_)
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(b"not a snapshot").unwrap_err(),
            Error::StateCorruption(_)
        ));
    }
}
