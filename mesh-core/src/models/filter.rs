//! Candidate filters applied during listing and resolution.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::instance::ServiceInstance;

/// Filter over service instances.
///
/// All populated dimensions must match (`tags` is subset containment,
/// `min_version`/`max_version` are inclusive bounds).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceFilter {
    pub tags: BTreeSet<String>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    pub region: Option<String>,
    pub min_health: Option<f64>,
}

impl InstanceFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.min_version.is_none()
            && self.max_version.is_none()
            && self.region.is_none()
            && self.min_health.is_none()
    }

    /// Whether `instance` satisfies every populated dimension.
    #[must_use]
    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        if !self.tags.is_subset(&instance.tags) {
            return false;
        }
        if let Some(region) = &self.region {
            if &instance.region != region {
                return false;
            }
        }
        if let Some(min) = &self.min_version {
            if compare_versions(&instance.version, min) == Ordering::Less {
                return false;
            }
        }
        if let Some(max) = &self.max_version {
            if compare_versions(&instance.version, max) == Ordering::Greater {
                return false;
            }
        }
        if let Some(min_health) = self.min_health {
            if instance.health_score < min_health {
                return false;
            }
        }
        true
    }

    /// Stable hash used as a cache key component. Identical filters always
    /// produce identical hashes across processes.
    #[must_use]
    pub fn filter_hash(&self) -> u64 {
        let mut hasher = Sha256::new();
        for tag in &self.tags {
            hasher.update(b"t:");
            hasher.update(tag.as_bytes());
            hasher.update([0u8]);
        }
        if let Some(v) = &self.min_version {
            hasher.update(b"vmin:");
            hasher.update(v.as_bytes());
        }
        if let Some(v) = &self.max_version {
            hasher.update(b"vmax:");
            hasher.update(v.as_bytes());
        }
        if let Some(r) = &self.region {
            hasher.update(b"r:");
            hasher.update(r.as_bytes());
        }
        if let Some(h) = self.min_health {
            hasher.update(b"h:");
            hasher.update(h.to_bits().to_be_bytes());
        }
        let digest = hasher.finalize();
        u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
    }
}

/// Compare dotted version strings segment by segment. Numeric segments
/// compare numerically, everything else lexicographically; missing segments
/// compare as zero ("1.2" < "1.2.1").
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => {
                let l = l.unwrap_or("0");
                let r = r.unwrap_or("0");
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
