//! Authoritative in-process service registry.
//!
//! Owns every `ServiceInstance` record. Mutations are serialized under one
//! write lock and perform no I/O; readers copy instances out before
//! releasing. Downstream components hold instance ids only and re-fetch on
//! every use.

mod events;
mod index;
mod snapshot;
mod sweeper;

pub use events::{EventFilter, EventHub, Subscription};
pub use index::{MetadataIndex, MAX_TAGS, MAX_TAG_LEN};
pub use snapshot::{
    decode as snapshot_decode, encode as snapshot_encode, SnapshotBlob, SnapshotHeader,
    SCHEMA_VERSION,
};
pub use sweeper::Sweeper;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use mesh_core::config::RegistryConfig;
use mesh_core::{
    metrics, Error, InstanceFilter, RegistryEvent, Result, ServiceInstance, ServiceStatus,
};

#[derive(Default)]
struct RegistryState {
    /// service name -> instance id -> record
    services: HashMap<String, HashMap<String, ServiceInstance>>,
    /// instance id -> owning service (invariant: an id lives in one service)
    id_to_service: HashMap<String, String>,
}

impl RegistryState {
    fn get(&self, instance_id: &str) -> Option<&ServiceInstance> {
        let service = self.id_to_service.get(instance_id)?;
        self.services.get(service)?.get(instance_id)
    }

    fn get_mut(&mut self, instance_id: &str) -> Option<&mut ServiceInstance> {
        let service = self.id_to_service.get(instance_id)?.clone();
        self.services.get_mut(&service)?.get_mut(instance_id)
    }

    fn insert(&mut self, instance: ServiceInstance) {
        self.id_to_service
            .insert(instance.instance_id.clone(), instance.service_name.clone());
        self.services
            .entry(instance.service_name.clone())
            .or_default()
            .insert(instance.instance_id.clone(), instance);
    }

    fn remove(&mut self, instance_id: &str) -> Option<ServiceInstance> {
        let service = self.id_to_service.remove(instance_id)?;
        let bucket = self.services.get_mut(&service)?;
        let removed = bucket.remove(instance_id);
        if bucket.is_empty() {
            self.services.remove(&service);
        }
        removed
    }
}

/// Counts reported after a peer-sync merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub conflicts: usize,
}

impl MergeOutcome {
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.inserted + self.updated > 0
    }
}

/// The registry. Cheap to share via `Arc`.
pub struct ServiceRegistry {
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    index: Mutex<MetadataIndex>,
    hub: EventHub,
    /// Lazily computed canonical state hash; `None` after any mutation.
    cached_hash: Mutex<Option<String>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        let hub = EventHub::new(config.event_queue_bound);
        Self {
            config,
            state: RwLock::new(RegistryState::default()),
            index: Mutex::new(MetadataIndex::new()),
            hub,
            cached_hash: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a new instance, or refresh an identical re-registration.
    ///
    /// A colliding `instance_id` under a different service or address is a
    /// `DuplicateInstance` error. New instances enter as `STARTING`.
    pub fn register(&self, mut instance: ServiceInstance) -> Result<ServiceInstance> {
        validate_instance(&instance)?;

        let now = Utc::now();
        let stored = {
            let mut state = self.state.write();

            if let Some(existing) = state.get(&instance.instance_id) {
                if existing.service_name != instance.service_name
                    || existing.address != instance.address
                    || existing.port != instance.port
                {
                    return Err(Error::DuplicateInstance(instance.instance_id));
                }
                // Identical identity: refresh in place, keep the original
                // registration time.
                instance.registered_at = existing.registered_at;
            }

            instance.status = ServiceStatus::Starting;
            instance.health_score = 0.5;
            instance.last_heartbeat_at = now;

            let before = state.get(&instance.instance_id).cloned();
            state.insert(instance.clone());

            let mut index = self.index.lock();
            match before {
                Some(before) => index.update(&before, &instance),
                None => index.insert(&instance),
            }

            let event = RegistryEvent::Registered {
                service: instance.service_name.clone(),
                instance_id: instance.instance_id.clone(),
                timestamp: now,
            };
            // Publish before releasing the write lock so subscribers observe
            // per-instance events in mutation order. Enqueueing never blocks.
            self.invalidate_hash();
            self.hub.publish(&event);
            instance
        };

        debug!(
            instance_id = %stored.instance_id,
            service = %stored.service_name,
            "Instance registered"
        );
        Ok(stored)
    }

    /// Record a heartbeat. The first heartbeat moves `STARTING` to `RUNNING`.
    pub fn heartbeat(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let instance = state
            .get_mut(instance_id)
            .ok_or_else(|| Error::NotFound(instance_id.to_string()))?;

        let now = Utc::now();
        instance.last_heartbeat_at = now;

        let event = if instance.status == ServiceStatus::Starting {
            instance.status = ServiceStatus::Running;
            Some(RegistryEvent::StatusChanged {
                service: instance.service_name.clone(),
                instance_id: instance.instance_id.clone(),
                from: ServiceStatus::Starting,
                to: ServiceStatus::Running,
                timestamp: now,
            })
        } else {
            None
        };

        self.invalidate_hash();
        if let Some(event) = event {
            self.hub.publish(&event);
        }
        Ok(())
    }

    /// Move an instance along the lifecycle graph. Idempotent for the same
    /// status; rejects edges outside the graph.
    pub fn update_status(&self, instance_id: &str, new_status: ServiceStatus) -> Result<()> {
        let mut state = self.state.write();
        let instance = state
            .get_mut(instance_id)
            .ok_or_else(|| Error::NotFound(instance_id.to_string()))?;

        let old = instance.status;
        if old == new_status {
            return Ok(());
        }
        if !old.can_transition_to(new_status) {
            return Err(Error::InvalidTransition {
                from: old.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        instance.status = new_status;
        if new_status == ServiceStatus::Stopped {
            // A stopped instance carries no health.
            instance.health_score = 0.0;
        }

        let event = RegistryEvent::StatusChanged {
            service: instance.service_name.clone(),
            instance_id: instance.instance_id.clone(),
            from: old,
            to: new_status,
            timestamp: Utc::now(),
        };

        self.invalidate_hash();
        self.hub.publish(&event);
        Ok(())
    }

    /// Merge a metadata patch and reindex.
    pub fn update_metadata(
        &self,
        instance_id: &str,
        patch: BTreeMap<String, String>,
    ) -> Result<()> {
        {
            let mut state = self.state.write();
            let instance = state
                .get_mut(instance_id)
                .ok_or_else(|| Error::NotFound(instance_id.to_string()))?;

            let before = instance.clone();
            for (key, value) in patch {
                instance.metadata.insert(key, value);
            }
            let after = instance.clone();
            self.index.lock().update(&before, &after);

            let event = RegistryEvent::MetadataUpdated {
                service: after.service_name,
                instance_id: after.instance_id,
                timestamp: Utc::now(),
            };
            self.invalidate_hash();
            self.hub.publish(&event);
        };
        Ok(())
    }

    /// Write a derived health score. Scores on `STOPPED` instances stay zero.
    pub fn update_health(&self, instance_id: &str, score: f64) -> Result<()> {
        let (service, applied) = {
            let mut state = self.state.write();
            let instance = state
                .get_mut(instance_id)
                .ok_or_else(|| Error::NotFound(instance_id.to_string()))?;

            let applied = if instance.status == ServiceStatus::Stopped {
                0.0
            } else {
                score.clamp(0.0, 1.0)
            };
            instance.health_score = applied;
            (instance.service_name.clone(), applied)
        };

        self.invalidate_hash();
        metrics::set_instance_health(&service, instance_id, applied);
        Ok(())
    }

    /// Adjust the connection gauge for an instance, saturating at zero.
    pub fn adjust_active_connections(&self, instance_id: &str, delta: i64) -> Result<u32> {
        let (service, count) = {
            let mut state = self.state.write();
            let instance = state
                .get_mut(instance_id)
                .ok_or_else(|| Error::NotFound(instance_id.to_string()))?;

            let current = i64::from(instance.active_connections);
            let next = u32::try_from((current + delta).max(0)).unwrap_or(u32::MAX);
            instance.active_connections = next;
            (instance.service_name.clone(), next)
        };

        self.invalidate_hash();
        metrics::ACTIVE_CONNECTIONS
            .with_label_values(&[&service, instance_id])
            .set(i64::from(count));
        Ok(count)
    }

    /// Begin deregistration: `STOPPING` now, removal after the grace period.
    /// New resolutions skip the instance immediately; in-flight requests get
    /// the grace window to complete.
    pub fn deregister(self: &Arc<Self>, instance_id: &str, reason: &str) -> Result<()> {
        self.update_status(instance_id, ServiceStatus::Stopping)
            .map_err(|e| match e {
                // Already on the way out: treat as idempotent.
                Error::InvalidTransition { .. } => Error::NotFound(instance_id.to_string()),
                other => other,
            })?;

        let registry = Arc::clone(self);
        let instance_id = instance_id.to_string();
        let reason = reason.to_string();
        let grace = Duration::from_secs(self.config.deregister_grace_secs);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.evict(&instance_id, &reason);
        });
        Ok(())
    }

    /// Immediate removal. Used by the deregistration grace task and the
    /// expiry sweeper.
    pub(crate) fn evict(&self, instance_id: &str, reason: &str) {
        {
            let mut state = self.state.write();
            let Some(mut removed) = state.remove(instance_id) else {
                return;
            };
            self.index.lock().remove(&removed);

            let now = Utc::now();
            let mut events = Vec::with_capacity(2);
            if removed.status != ServiceStatus::Stopped
                && removed.status.can_transition_to(ServiceStatus::Stopped)
            {
                events.push(RegistryEvent::StatusChanged {
                    service: removed.service_name.clone(),
                    instance_id: removed.instance_id.clone(),
                    from: removed.status,
                    to: ServiceStatus::Stopped,
                    timestamp: now,
                });
                removed.status = ServiceStatus::Stopped;
            }
            events.push(RegistryEvent::Deregistered {
                service: removed.service_name.clone(),
                instance_id: removed.instance_id.clone(),
                reason: reason.to_string(),
                timestamp: now,
            });
            metrics::forget_instance(&removed.service_name, &removed.instance_id);

            self.invalidate_hash();
            for event in &events {
                self.hub.publish(event);
            }
        };
        info!(instance_id, reason, "Instance removed from registry");
    }

    /// List instances of a service matching `filter`.
    pub fn list(&self, service_name: &str, filter: &InstanceFilter) -> Vec<ServiceInstance> {
        let state = self.state.read();
        let Some(bucket) = state.services.get(service_name) else {
            return Vec::new();
        };

        // Narrow by the inverted index when tag/region dimensions are set;
        // the remaining dimensions are checked per instance.
        let narrowed: Option<std::collections::HashSet<String>> = {
            let tags: Vec<&str> = filter.tags.iter().map(String::as_str).collect();
            if tags.is_empty() && filter.region.is_none() {
                None
            } else {
                self.index
                    .lock()
                    .query(&tags, None, None, filter.region.as_deref())
            }
        };

        let mut matched: Vec<ServiceInstance> = bucket
            .values()
            .filter(|inst| {
                narrowed
                    .as_ref()
                    .is_none_or(|ids| ids.contains(&inst.instance_id))
            })
            .filter(|inst| filter.matches(inst))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        matched
    }

    /// Fetch one instance by id.
    pub fn get(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.state.read().get(instance_id).cloned()
    }

    /// The service an instance id belongs to.
    pub fn service_of(&self, instance_id: &str) -> Option<String> {
        self.state.read().id_to_service.get(instance_id).cloned()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn instance_count(&self) -> usize {
        self.state.read().id_to_service.len()
    }

    /// Every instance, sorted by id. This is the canonical ordering used for
    /// snapshots and state hashing.
    pub fn all_instances(&self) -> Vec<ServiceInstance> {
        let state = self.state.read();
        let mut instances: Vec<ServiceInstance> = state
            .services
            .values()
            .flat_map(|bucket| bucket.values().cloned())
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        instances
    }

    /// Cross-service metadata query via the inverted index.
    pub fn query_index(
        &self,
        tags: &[&str],
        version: Option<&str>,
        environment: Option<&str>,
        region: Option<&str>,
    ) -> Vec<ServiceInstance> {
        let Some(ids) = self.index.lock().query(tags, version, environment, region) else {
            return self.all_instances();
        };
        let state = self.state.read();
        let mut instances: Vec<ServiceInstance> =
            ids.iter().filter_map(|id| state.get(id).cloned()).collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        instances
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.hub.subscribe(filter)
    }

    pub fn unsubscribe(&self, subscription_id: &str) {
        self.hub.unsubscribe(subscription_id);
    }

    /// Canonical SHA-256 of the sorted registry state, hex-encoded.
    /// Recomputed lazily after mutations.
    ///
    /// The hash cache lock is never held across the state lock: mutation
    /// paths take them in the opposite order.
    pub fn state_hash(&self) -> String {
        if let Some(hash) = self.cached_hash.lock().clone() {
            return hash;
        }
        let hash = snapshot::canonical_hash(&self.all_instances());
        *self.cached_hash.lock() = Some(hash.clone());
        hash
    }

    /// Serialize the full registry into a snapshot blob.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        snapshot::encode(self.all_instances())
    }

    /// Replace the registry contents from a snapshot blob. Validates the
    /// schema and embedded hash before touching any state.
    pub fn restore(&self, bytes: &[u8]) -> Result<usize> {
        let blob = snapshot::decode(bytes)?;
        let count = blob.instances.len();

        let mut state = self.state.write();
        let mut index = self.index.lock();
        state.services.clear();
        state.id_to_service.clear();
        index.clear();
        for instance in blob.instances {
            index.insert(&instance);
            state.insert(instance);
        }
        *self.cached_hash.lock() = Some(blob.header.state_hash);
        drop(index);
        drop(state);

        info!(instances = count, "Registry state restored from snapshot");
        Ok(count)
    }

    /// Merge instances pulled from a peer. Local records win ties; the
    /// precedence is heartbeat recency then version (flipped when
    /// `prefer_version` is set), with `instance_id` as the final arbiter.
    pub fn merge_remote(
        &self,
        remote_instances: Vec<ServiceInstance>,
        peer: &str,
        prefer_version: bool,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut events = Vec::new();

        {
            let mut state = self.state.write();
            let mut index = self.index.lock();

            for remote in remote_instances {
                if validate_instance(&remote).is_err() {
                    warn!(
                        peer,
                        instance_id = %remote.instance_id,
                        "Dropping invalid instance from peer"
                    );
                    outcome.conflicts += 1;
                    continue;
                }

                match state.get(&remote.instance_id).cloned() {
                    None => {
                        index.insert(&remote);
                        events.push(RegistryEvent::Registered {
                            service: remote.service_name.clone(),
                            instance_id: remote.instance_id.clone(),
                            timestamp: Utc::now(),
                        });
                        state.insert(remote);
                        outcome.inserted += 1;
                    }
                    Some(local) => {
                        if local.service_name != remote.service_name {
                            // An id may only live in one service; keep ours.
                            outcome.conflicts += 1;
                            continue;
                        }
                        if remote_wins(&remote, &local, prefer_version) {
                            index.update(&local, &remote);
                            events.push(RegistryEvent::Registered {
                                service: remote.service_name.clone(),
                                instance_id: remote.instance_id.clone(),
                                timestamp: Utc::now(),
                            });
                            state.insert(remote);
                            outcome.updated += 1;
                        } else {
                            outcome.conflicts += 1;
                        }
                    }
                }
            }

            if outcome.changed() {
                self.invalidate_hash();
            }
            for event in &events {
                self.hub.publish(event);
            }
        }
        outcome
    }

    /// Publish a sync summary event. Called by the peer sync manager after a
    /// round that applied changes.
    pub fn publish_sync_applied(&self, peer: &str, outcome: MergeOutcome) {
        self.hub.publish(&RegistryEvent::SyncApplied {
            peer: peer.to_string(),
            inserted: outcome.inserted,
            updated: outcome.updated,
            conflicts: outcome.conflicts,
            timestamp: Utc::now(),
        });
    }

    fn invalidate_hash(&self) {
        *self.cached_hash.lock() = None;
    }
}

/// Ordering between a remote and local copy of the same instance.
fn remote_wins(remote: &ServiceInstance, local: &ServiceInstance, prefer_version: bool) -> bool {
    use std::cmp::Ordering;

    let by_heartbeat = remote.last_heartbeat_at.cmp(&local.last_heartbeat_at);
    let by_version = mesh_core::models::compare_versions(&remote.version, &local.version);

    let (primary, secondary) = if prefer_version {
        (by_version, by_heartbeat)
    } else {
        (by_heartbeat, by_version)
    };

    match primary.then(secondary) {
        Ordering::Greater => true,
        // Ties (same id, so the id key never differs) keep local.
        Ordering::Less | Ordering::Equal => false,
    }
}

fn validate_instance(instance: &ServiceInstance) -> Result<()> {
    if instance.instance_id.is_empty() {
        return Err(Error::InvalidInput("instance_id must not be empty".into()));
    }
    if instance.service_name.is_empty() {
        return Err(Error::InvalidInput("service_name must not be empty".into()));
    }
    if instance.address.is_empty() {
        return Err(Error::InvalidInput("address must not be empty".into()));
    }
    if instance.port == 0 {
        return Err(Error::InvalidInput("port must be between 1 and 65535".into()));
    }
    if instance.weight == 0 {
        return Err(Error::InvalidInput("weight must be at least 1".into()));
    }
    if instance.tags.len() > MAX_TAGS {
        return Err(Error::InvalidInput(format!(
            "at most {MAX_TAGS} tags per instance"
        )));
    }
    if let Some(tag) = instance.tags.iter().find(|t| t.len() > MAX_TAG_LEN) {
        return Err(Error::InvalidInput(format!(
            "tag '{tag}' exceeds {MAX_TAG_LEN} bytes"
        )));
    }
    if !(0.0..=1.0).contains(&instance.health_score) {
        return Err(Error::InvalidInput(
            "health_score must be within [0,1]".into(),
        ));
    }
    Ok(())
}
