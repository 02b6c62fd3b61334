//! Inverted metadata index over registered instances.
//!
//! Maintained synchronously with every register/update/deregister so that
//! tag/version/environment/region queries never scan the full registry.

use std::collections::{HashMap, HashSet};

use mesh_core::ServiceInstance;

/// Metadata key treated as the instance's environment dimension.
const ENVIRONMENT_KEY: &str = "environment";

/// Bounds from the data model: at most 32 tags per instance, 128 bytes each.
pub const MAX_TAGS: usize = 32;
pub const MAX_TAG_LEN: usize = 128;

#[derive(Debug, Default)]
pub struct MetadataIndex {
    by_tag: HashMap<String, HashSet<String>>,
    by_version: HashMap<String, HashSet<String>>,
    by_environment: HashMap<String, HashSet<String>>,
    by_region: HashMap<String, HashSet<String>>,
}

impl MetadataIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instance: &ServiceInstance) {
        let id = &instance.instance_id;
        for tag in &instance.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(id.clone());
        }
        if !instance.version.is_empty() {
            self.by_version
                .entry(instance.version.clone())
                .or_default()
                .insert(id.clone());
        }
        if !instance.region.is_empty() {
            self.by_region
                .entry(instance.region.clone())
                .or_default()
                .insert(id.clone());
        }
        if let Some(env) = instance.metadata.get(ENVIRONMENT_KEY) {
            self.by_environment
                .entry(env.clone())
                .or_default()
                .insert(id.clone());
        }
    }

    pub fn remove(&mut self, instance: &ServiceInstance) {
        let id = &instance.instance_id;
        for tag in &instance.tags {
            prune(&mut self.by_tag, tag, id);
        }
        if !instance.version.is_empty() {
            prune(&mut self.by_version, &instance.version, id);
        }
        if !instance.region.is_empty() {
            prune(&mut self.by_region, &instance.region, id);
        }
        if let Some(env) = instance.metadata.get(ENVIRONMENT_KEY) {
            prune(&mut self.by_environment, env, id);
        }
    }

    /// Reindex after a mutation: remove the old projection, insert the new.
    pub fn update(&mut self, before: &ServiceInstance, after: &ServiceInstance) {
        self.remove(before);
        self.insert(after);
    }

    #[must_use]
    pub fn ids_with_tag(&self, tag: &str) -> Option<&HashSet<String>> {
        self.by_tag.get(tag)
    }

    #[must_use]
    pub fn ids_with_region(&self, region: &str) -> Option<&HashSet<String>> {
        self.by_region.get(region)
    }

    #[must_use]
    pub fn ids_with_version(&self, version: &str) -> Option<&HashSet<String>> {
        self.by_version.get(version)
    }

    #[must_use]
    pub fn ids_with_environment(&self, env: &str) -> Option<&HashSet<String>> {
        self.by_environment.get(env)
    }

    /// Intersect several dimensions, smallest set first so each further
    /// intersection shrinks the working set as fast as possible.
    /// `None` when no dimension was given.
    #[must_use]
    pub fn query(
        &self,
        tags: &[&str],
        version: Option<&str>,
        environment: Option<&str>,
        region: Option<&str>,
    ) -> Option<HashSet<String>> {
        let mut sets: Vec<&HashSet<String>> = Vec::new();
        static EMPTY: std::sync::LazyLock<HashSet<String>> =
            std::sync::LazyLock::new(HashSet::new);

        for tag in tags {
            sets.push(self.ids_with_tag(tag).unwrap_or(&EMPTY));
        }
        if let Some(version) = version {
            sets.push(self.ids_with_version(version).unwrap_or(&EMPTY));
        }
        if let Some(env) = environment {
            sets.push(self.ids_with_environment(env).unwrap_or(&EMPTY));
        }
        if let Some(region) = region {
            sets.push(self.ids_with_region(region).unwrap_or(&EMPTY));
        }

        if sets.is_empty() {
            return None;
        }
        sets.sort_by_key(|s| s.len());

        let mut result = sets[0].clone();
        for set in &sets[1..] {
            if result.is_empty() {
                break;
            }
            result.retain(|id| set.contains(id));
        }
        Some(result)
    }

    pub fn clear(&mut self) {
        self.by_tag.clear();
        self.by_version.clear();
        self.by_environment.clear();
        self.by_region.clear();
    }
}

fn prune(map: &mut HashMap<String, HashSet<String>>, key: &str, id: &str) {
    if let Some(set) = map.get_mut(key) {
        set.remove(id);
        if set.is_empty() {
            map.remove(key);
        }
    }
}
