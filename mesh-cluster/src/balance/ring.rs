//! Consistent-hash ring with virtual nodes.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

/// Stable 64-bit hash shared by ring positions and lookup keys.
#[must_use]
pub fn hash64(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}

/// Immutable ring snapshot. Rebuilt on membership change only; lookups are
/// read-only so callers share snapshots via `Arc`.
#[derive(Debug)]
pub struct HashRing {
    positions: BTreeMap<u64, String>,
    members: BTreeSet<String>,
}

impl HashRing {
    /// Build a ring with `virtual_nodes` positions per member. Position
    /// collisions keep the lexicographically smaller instance id.
    #[must_use]
    pub fn build<I, S>(members: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: BTreeSet<String> = members.into_iter().map(Into::into).collect();
        let mut positions = BTreeMap::new();

        for member in &members {
            for vnode in 0..virtual_nodes {
                let position = hash64(&format!("{member}#{vnode}"));
                positions
                    .entry(position)
                    .and_modify(|existing: &mut String| {
                        if member < existing {
                            *existing = member.clone();
                        }
                    })
                    .or_insert_with(|| member.clone());
            }
        }

        Self { positions, members }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[must_use]
    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }

    /// Owner of `key`: the member at the smallest ring position at or after
    /// `hash(key)`, wrapping around.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.walk(key).next()
    }

    /// Members in ring order starting at `hash(key)`, each yielded once.
    /// Lets callers skip members that are currently filtered out.
    pub fn walk<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> + 'a {
        let start = hash64(key);
        let mut seen = BTreeSet::new();
        self.positions
            .range(start..)
            .chain(self.positions.range(..start))
            .map(|(_, member)| member.as_str())
            .filter(move |member| seen.insert(member.to_string()))
    }
}
