//! Strategy-driven instance resolution.
//!
//! Merges the registry view with DNS discovery, filters by status, health
//! and open circuits, applies the requested strategy and caches the
//! candidate list briefly. Holds instance ids only; records are re-fetched
//! on every call.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::IndexedRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mesh_core::config::ResolutionConfig;
use mesh_core::{
    metrics, ClientContext, Error, InstanceFilter, Result, ServiceInstance, Strategy,
};

use crate::balance::StrategySet;
use crate::circuit::CircuitBreakerRegistry;
use crate::registry::{EventFilter, ServiceRegistry};

use super::dns::DnsResolver;

pub struct ResolutionEngine {
    registry: Arc<ServiceRegistry>,
    dns: Option<Arc<DnsResolver>>,
    circuits: Arc<CircuitBreakerRegistry>,
    strategies: Arc<StrategySet>,
    config: ResolutionConfig,
    default_strategy: Strategy,
    cache: moka::sync::Cache<(String, u64), Arc<Vec<ServiceInstance>>>,
}

impl ResolutionEngine {
    #[must_use]
    pub fn new(
        registry: Arc<ServiceRegistry>,
        dns: Option<Arc<DnsResolver>>,
        circuits: Arc<CircuitBreakerRegistry>,
        strategies: Arc<StrategySet>,
        config: ResolutionConfig,
        default_strategy: Strategy,
    ) -> Arc<Self> {
        let cache = moka::sync::Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_millis(config.cache_ttl_ms.max(1)))
            .support_invalidation_closures()
            .build();

        Arc::new(Self {
            registry,
            dns,
            circuits,
            strategies,
            config,
            default_strategy,
            cache,
        })
    }

    /// Spawn the invalidation worker: any event that changes resolvability
    /// evicts the service's cached candidates, and removed instances are
    /// purged from circuits and strategy state.
    pub fn spawn_invalidation_task(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let subscription = engine.registry.subscribe(EventFilter::default());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Resolution cache invalidation task shutting down");
                        return;
                    }
                    event = subscription.recv() => {
                        let Some(event) = event else { return };
                        if event.affects_resolution() {
                            if let Some(service) = event.service() {
                                engine.invalidate_service(service);
                            }
                        }
                        if event.event_type() == "deregistered" {
                            if let Some(instance_id) = event.instance_id() {
                                engine.circuits.purge_instance(instance_id);
                                engine.strategies.purge_instance(instance_id);
                            }
                        }
                    }
                }
            }
        })
    }

    /// Resolve `service` to exactly one instance.
    pub async fn resolve(
        &self,
        service: &str,
        filter: &InstanceFilter,
        strategy: Option<Strategy>,
        context: &ClientContext,
    ) -> Result<ServiceInstance> {
        let strategy = strategy.unwrap_or(self.default_strategy);
        let timer = metrics::REQUEST_DURATION_SECONDS
            .with_label_values(&[service])
            .start_timer();

        let result = self
            .resolve_inner(service, filter, strategy, context)
            .await;
        timer.observe_duration();

        match &result {
            Ok(instance) => {
                metrics::REQUESTS_TOTAL
                    .with_label_values(&[service, strategy.name()])
                    .inc();
                debug!(
                    service,
                    instance_id = %instance.instance_id,
                    strategy = strategy.name(),
                    "Resolved"
                );
            }
            Err(e) => {
                metrics::LB_ERRORS_TOTAL
                    .with_label_values(&[service, e.reason()])
                    .inc();
            }
        }
        result
    }

    async fn resolve_inner(
        &self,
        service: &str,
        filter: &InstanceFilter,
        strategy: Strategy,
        context: &ClientContext,
    ) -> Result<ServiceInstance> {
        let mut candidates = self.candidates(service, filter).await?;

        // NEAREST partitions by the caller's region and prefers its own,
        // falling back to everything else when the preferred set is empty.
        if strategy == Strategy::Nearest {
            if let Some(region) = &context.region {
                let (same, other): (Vec<_>, Vec<_>) = candidates
                    .into_iter()
                    .partition(|inst| &inst.region == region);
                candidates = if same.is_empty() { other } else { same };
            }
        }

        // Selection plus circuit admission: a pick whose breaker refuses the
        // call is excluded and the strategy re-applied to the remainder.
        loop {
            let picked = match self
                .strategies
                .select(service, strategy, &candidates, context)
            {
                Ok(Some(instance)) => instance,
                Ok(None) => return Err(Error::NoCandidates(service.to_string())),
                Err(e) => {
                    // Strategy failure never surfaces: fall back to a random
                    // healthy candidate and count the event.
                    warn!(service, strategy = strategy.name(), error = %e, "Strategy failed");
                    metrics::LB_ERRORS_TOTAL
                        .with_label_values(&[service, "strategy_failure"])
                        .inc();
                    return candidates
                        .choose(&mut rand::rng())
                        .cloned()
                        .ok_or_else(|| Error::NoCandidates(service.to_string()));
                }
            };

            match self.circuits.try_acquire_existing(service, &picked.instance_id) {
                Ok(()) => return Ok(picked),
                Err(_) => {
                    candidates.retain(|c| c.instance_id != picked.instance_id);
                    if candidates.is_empty() {
                        return Err(Error::NoCandidates(service.to_string()));
                    }
                }
            }
        }
    }

    /// Assemble (or fetch cached) candidates: registry primary, DNS
    /// secondary, merged by instance id with the registry winning.
    async fn candidates(
        &self,
        service: &str,
        filter: &InstanceFilter,
    ) -> Result<Vec<ServiceInstance>> {
        // A zero TTL disables result caching entirely.
        let caching = self.config.cache_ttl_ms > 0;
        let key = (service.to_string(), filter.filter_hash());
        if caching {
            if let Some(cached) = self.cache.get(&key) {
                metrics::CACHE_HITS_TOTAL
                    .with_label_values(&["resolution"])
                    .inc();
                return Ok(cached.as_ref().clone());
            }
            metrics::CACHE_MISSES_TOTAL
                .with_label_values(&["resolution"])
                .inc();
        }

        let mut merged = self.registry.list(service, filter);

        if let Some(dns) = &self.dns {
            match dns.resolve(service, filter).await {
                Ok(discovered) => {
                    for instance in discovered {
                        if !merged
                            .iter()
                            .any(|existing| existing.instance_id == instance.instance_id)
                        {
                            merged.push(instance);
                        }
                    }
                }
                Err(e) => {
                    debug!(service, error = %e, "DNS tier contributed nothing");
                }
            }
        }

        let min_health = filter.min_health.unwrap_or(self.config.min_health);
        let mut eligible: Vec<ServiceInstance> = merged
            .into_iter()
            .filter(|inst| inst.status.is_resolvable())
            .filter(|inst| inst.health_score >= min_health)
            .filter(|inst| self.circuits.allows(service, &inst.instance_id))
            .collect();
        eligible.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        if eligible.is_empty() {
            return Err(Error::NoCandidates(service.to_string()));
        }
        if caching {
            self.cache.insert(key, Arc::new(eligible.clone()));
        }
        Ok(eligible)
    }

    /// Report a call outcome for circuit accounting.
    pub fn report_outcome(&self, service: &str, instance_id: &str, success: bool) {
        self.circuits.report(service, instance_id, success);
        // Circuit movement changes admissibility; drop cached candidates.
        self.invalidate_service(service);
    }

    pub fn invalidate_service(&self, service: &str) {
        let service = service.to_string();
        let _ = self
            .cache
            .invalidate_entries_if(move |key, _| key.0 == service);
    }
}
