//! Load-balancing strategies.
//!
//! One `StrategySet` owns all per-service selection state: round-robin
//! counters, smooth weighted-round-robin weights, consistent-hash ring
//! snapshots and the adaptive controller. Candidates arrive already
//! health-filtered and sorted by instance id.

mod ring;

pub use ring::{hash64, HashRing};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::seq::IndexedRandom;
use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use mesh_core::config::BalanceConfig;
use mesh_core::{ClientContext, Error, Result, ServiceInstance, Strategy};

/// Health scores below this floor still divide cleanly.
const HEALTH_FLOOR: f64 = 0.01;

struct RingHolder {
    /// Sorted candidate ids the current snapshot was built from.
    fingerprint: Vec<String>,
    ring: Arc<HashRing>,
}

struct AdaptiveState {
    current: Strategy,
    last_eval: Instant,
}

pub struct StrategySet {
    config: BalanceConfig,
    rr_counters: DashMap<String, AtomicUsize>,
    wrr_weights: DashMap<String, Mutex<HashMap<String, i64>>>,
    rings: DashMap<String, RwLock<RingHolder>>,
    adaptive: DashMap<String, Mutex<AdaptiveState>>,
}

impl StrategySet {
    #[must_use]
    pub fn new(config: BalanceConfig) -> Self {
        Self {
            config,
            rr_counters: DashMap::new(),
            wrr_weights: DashMap::new(),
            rings: DashMap::new(),
            adaptive: DashMap::new(),
        }
    }

    /// Pick one candidate. `Ok(None)` when the candidate set is empty;
    /// errors only for unusable input (e.g. consistent-hash without a key).
    pub fn select(
        &self,
        service: &str,
        strategy: Strategy,
        candidates: &[ServiceInstance],
        context: &ClientContext,
    ) -> Result<Option<ServiceInstance>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        if candidates.len() == 1 {
            return Ok(Some(candidates[0].clone()));
        }

        match strategy {
            Strategy::RoundRobin | Strategy::Nearest => Ok(self.round_robin(service, candidates)),
            Strategy::WeightedRoundRobin => Ok(self.weighted_round_robin(service, candidates)),
            Strategy::LeastConnections => Ok(least_connections(candidates)),
            Strategy::PowerOfTwo => Ok(power_of_two(candidates)),
            Strategy::WeightedRandom => Ok(weighted_random(candidates)),
            Strategy::ConsistentHash => self.consistent_hash(service, candidates, context),
            Strategy::ResourceAware => Ok(resource_aware(candidates)),
            Strategy::Adaptive => {
                let chosen = self.adaptive_choice(service, candidates);
                self.select(service, chosen, candidates, context)
            }
        }
    }

    /// Forget selection state tied to a removed instance.
    pub fn purge_instance(&self, instance_id: &str) {
        for entry in self.wrr_weights.iter() {
            entry.value().lock().remove(instance_id);
        }
        // Rings rebuild themselves on the next membership mismatch.
    }

    fn round_robin(&self, service: &str, candidates: &[ServiceInstance]) -> Option<ServiceInstance> {
        let counter = self
            .rr_counters
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let index = counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }

    /// Smooth weighted round-robin: every pick adds each candidate's weight
    /// to its running current-weight, takes the maximum, then subtracts the
    /// weight total from the winner. Distributes exactly proportionally
    /// without bursts.
    fn weighted_round_robin(
        &self,
        service: &str,
        candidates: &[ServiceInstance],
    ) -> Option<ServiceInstance> {
        let entry = self
            .wrr_weights
            .entry(service.to_string())
            .or_insert_with(|| Mutex::new(HashMap::new()));
        let mut current = entry.value().lock();

        // Drop state for candidates that left the set.
        current.retain(|id, _| candidates.iter().any(|c| &c.instance_id == id));

        let total: i64 = candidates.iter().map(|c| i64::from(c.weight)).sum();
        if total == 0 {
            return candidates.first().cloned();
        }

        let mut best: Option<(&ServiceInstance, i64)> = None;
        for candidate in candidates {
            let weight = current
                .entry(candidate.instance_id.clone())
                .or_insert(0);
            *weight += i64::from(candidate.weight);
            let weight = *weight;
            match best {
                Some((_, best_weight)) if weight <= best_weight => {}
                _ => best = Some((candidate, weight)),
            }
        }

        let (winner, _) = best?;
        if let Some(weight) = current.get_mut(&winner.instance_id) {
            *weight -= total;
        }
        Some(winner.clone())
    }

    fn consistent_hash(
        &self,
        service: &str,
        candidates: &[ServiceInstance],
        context: &ClientContext,
    ) -> Result<Option<ServiceInstance>> {
        let key = context.hash_key.as_deref().ok_or_else(|| {
            Error::InvalidInput("consistent_hash requires a hash_key in the client context".into())
        })?;

        let fingerprint: Vec<String> =
            candidates.iter().map(|c| c.instance_id.clone()).collect();

        let holder = self.rings.entry(service.to_string()).or_insert_with(|| {
            RwLock::new(RingHolder {
                fingerprint: fingerprint.clone(),
                ring: Arc::new(HashRing::build(
                    fingerprint.iter().cloned(),
                    self.config.virtual_nodes,
                )),
            })
        });

        // Snapshot pointer swap: readers clone the Arc, the rebuild happens
        // under the write lock only when membership changed.
        let ring = {
            let guard = holder.read();
            if guard.fingerprint == fingerprint {
                guard.ring.clone()
            } else {
                drop(guard);
                let mut guard = holder.write();
                if guard.fingerprint != fingerprint {
                    debug!(service, "Rebuilding consistent-hash ring");
                    guard.fingerprint = fingerprint.clone();
                    guard.ring = Arc::new(HashRing::build(
                        fingerprint.iter().cloned(),
                        self.config.virtual_nodes,
                    ));
                }
                guard.ring.clone()
            }
        };

        for member in ring.walk(key) {
            if let Some(instance) = candidates.iter().find(|c| c.instance_id == member) {
                return Ok(Some(instance.clone()));
            }
        }
        Ok(None)
    }

    fn adaptive_choice(&self, service: &str, candidates: &[ServiceInstance]) -> Strategy {
        let reeval = Duration::from_secs(self.config.adaptive_reeval_secs);
        let entry = self.adaptive.entry(service.to_string()).or_insert_with(|| {
            Mutex::new(AdaptiveState {
                current: evaluate_adaptive(candidates),
                last_eval: Instant::now(),
            })
        });
        let mut state = entry.value().lock();
        if state.last_eval.elapsed() >= reeval {
            let next = evaluate_adaptive(candidates);
            if next != state.current {
                debug!(
                    service,
                    from = state.current.name(),
                    to = next.name(),
                    "Adaptive strategy switched"
                );
            }
            state.current = next;
            state.last_eval = Instant::now();
        }
        state.current
    }
}

/// Pick the wrapped strategy from current load shape: high variance favors
/// least-connections, high absolute load favors power-of-two, otherwise
/// weighted round-robin.
fn evaluate_adaptive(candidates: &[ServiceInstance]) -> Strategy {
    let connections: Vec<u32> = candidates.iter().map(|c| c.active_connections).collect();
    let max = connections.iter().copied().max().unwrap_or(0);
    let min = connections.iter().copied().min().unwrap_or(0);

    if max > 0 && f64::from(max - min) / f64::from(max) > 0.3 {
        return Strategy::LeastConnections;
    }

    #[allow(clippy::cast_precision_loss)]
    let avg = connections.iter().map(|c| f64::from(*c)).sum::<f64>() / connections.len() as f64;
    if avg > 100.0 {
        Strategy::PowerOfTwo
    } else {
        Strategy::WeightedRoundRobin
    }
}

fn least_connections(candidates: &[ServiceInstance]) -> Option<ServiceInstance> {
    candidates
        .iter()
        .min_by(|a, b| {
            let load_a = f64::from(a.active_connections) / a.health_score.max(HEALTH_FLOOR);
            let load_b = f64::from(b.active_connections) / b.health_score.max(HEALTH_FLOOR);
            load_a
                .total_cmp(&load_b)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        })
        .cloned()
}

fn power_of_two(candidates: &[ServiceInstance]) -> Option<ServiceInstance> {
    let mut rng = rand::rng();
    let first = rng.random_range(0..candidates.len());
    let mut second = rng.random_range(0..candidates.len() - 1);
    if second >= first {
        second += 1;
    }

    let score = |c: &ServiceInstance| {
        f64::from(c.active_connections) * (1.0 / c.health_score.max(HEALTH_FLOOR))
    };
    let (a, b) = (&candidates[first], &candidates[second]);
    let winner = match score(a).total_cmp(&score(b)) {
        std::cmp::Ordering::Less => a,
        std::cmp::Ordering::Greater => b,
        std::cmp::Ordering::Equal => {
            if a.instance_id < b.instance_id {
                a
            } else {
                b
            }
        }
    };
    Some(winner.clone())
}

fn weighted_random(candidates: &[ServiceInstance]) -> Option<ServiceInstance> {
    let weights: Vec<f64> = candidates
        .iter()
        .map(|c| f64::from(c.weight) * c.health_score)
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        // Everything weightless: fall back to a uniform pick.
        return candidates.choose(&mut rand::rng()).cloned();
    }

    let mut remaining = rand::rng().random_range(0.0..total);
    for (candidate, weight) in candidates.iter().zip(weights) {
        if remaining < weight {
            return Some(candidate.clone());
        }
        remaining -= weight;
    }
    candidates.last().cloned()
}

fn resource_aware(candidates: &[ServiceInstance]) -> Option<ServiceInstance> {
    candidates
        .iter()
        .min_by(|a, b| {
            resource_score(a)
                .total_cmp(&resource_score(b))
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        })
        .cloned()
}

/// Blend of cpu, memory and connection pressure, penalized by poor health.
/// Metrics missing from instance metadata default to 0.5.
fn resource_score(instance: &ServiceInstance) -> f64 {
    let cpu = instance.resource_metric("cpu");
    let mem = instance.resource_metric("mem");
    let conns = f64::from(instance.active_connections) / 100.0;
    (0.4 * cpu + 0.3 * mem + 0.3 * conns) / instance.health_score.max(HEALTH_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn candidate(id: &str, weight: u32) -> ServiceInstance {
        let mut inst = ServiceInstance::new(id, "auth", "10.0.0.1", 8080).with_weight(weight);
        inst.status = mesh_core::ServiceStatus::Running;
        inst.health_score = 1.0;
        inst
    }

    fn candidates(specs: &[(&str, u32)]) -> Vec<ServiceInstance> {
        let mut list: Vec<ServiceInstance> =
            specs.iter().map(|(id, w)| candidate(id, *w)).collect();
        list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        list
    }

    #[test]
    fn test_empty_candidates_returns_none_for_every_strategy() {
        let set = StrategySet::new(BalanceConfig::default());
        let ctx = ClientContext {
            hash_key: Some("k".to_string()),
            ..Default::default()
        };
        for strategy in [
            Strategy::RoundRobin,
            Strategy::WeightedRoundRobin,
            Strategy::LeastConnections,
            Strategy::PowerOfTwo,
            Strategy::WeightedRandom,
            Strategy::ConsistentHash,
            Strategy::ResourceAware,
            Strategy::Adaptive,
        ] {
            assert!(set.select("auth", strategy, &[], &ctx).unwrap().is_none());
        }
    }

    #[test]
    fn test_single_candidate_always_wins() {
        let set = StrategySet::new(BalanceConfig::default());
        let ctx = ClientContext {
            hash_key: Some("k".to_string()),
            ..Default::default()
        };
        let one = candidates(&[("a1", 1)]);
        for strategy in [
            Strategy::RoundRobin,
            Strategy::WeightedRoundRobin,
            Strategy::PowerOfTwo,
            Strategy::ConsistentHash,
            Strategy::Adaptive,
        ] {
            let picked = set.select("auth", strategy, &one, &ctx).unwrap().unwrap();
            assert_eq!(picked.instance_id, "a1");
        }
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let set = StrategySet::new(BalanceConfig::default());
        let list = candidates(&[("a1", 1), ("a2", 1), ("a3", 1)]);
        let ctx = ClientContext::default();

        let picks: Vec<String> = (0..6)
            .map(|_| {
                set.select("auth", Strategy::RoundRobin, &list, &ctx)
                    .unwrap()
                    .unwrap()
                    .instance_id
            })
            .collect();
        assert_eq!(picks, vec!["a1", "a2", "a3", "a1", "a2", "a3"]);
    }

    #[test]
    fn test_weighted_round_robin_exact_distribution() {
        let set = StrategySet::new(BalanceConfig::default());
        let list = candidates(&[("a1", 3), ("a2", 1)]);
        let ctx = ClientContext::default();

        let mut counts: StdHashMap<String, usize> = StdHashMap::new();
        for _ in 0..4_000 {
            let picked = set
                .select("auth", Strategy::WeightedRoundRobin, &list, &ctx)
                .unwrap()
                .unwrap();
            *counts.entry(picked.instance_id).or_default() += 1;
        }
        assert_eq!(counts.get("a1"), Some(&3_000));
        assert_eq!(counts.get("a2"), Some(&1_000));
    }

    #[test]
    fn test_weighted_round_robin_smoothness() {
        // Weights 3:1 must not produce bursts: a window of 4 always holds
        // exactly three a1 and one a2.
        let set = StrategySet::new(BalanceConfig::default());
        let list = candidates(&[("a1", 3), ("a2", 1)]);
        let ctx = ClientContext::default();

        let picks: Vec<String> = (0..12)
            .map(|_| {
                set.select("auth", Strategy::WeightedRoundRobin, &list, &ctx)
                    .unwrap()
                    .unwrap()
                    .instance_id
            })
            .collect();
        for window in picks.chunks(4) {
            let a1 = window.iter().filter(|id| id.as_str() == "a1").count();
            assert_eq!(a1, 3, "burst detected in {window:?}");
        }
    }

    #[test]
    fn test_least_connections_prefers_idle_and_ties_by_id() {
        let set = StrategySet::new(BalanceConfig::default());
        let mut list = candidates(&[("a1", 1), ("a2", 1), ("a3", 1)]);
        list[0].active_connections = 10;
        list[1].active_connections = 2;
        list[2].active_connections = 2;
        let picked = set
            .select("auth", Strategy::LeastConnections, &list, &ClientContext::default())
            .unwrap()
            .unwrap();
        assert_eq!(picked.instance_id, "a2");
    }

    #[test]
    fn test_least_connections_health_weighting() {
        let set = StrategySet::new(BalanceConfig::default());
        let mut list = candidates(&[("a1", 1), ("a2", 1)]);
        // a1 has fewer connections but is barely alive.
        list[0].active_connections = 4;
        list[0].health_score = 0.1;
        list[1].active_connections = 10;
        list[1].health_score = 1.0;
        let picked = set
            .select("auth", Strategy::LeastConnections, &list, &ClientContext::default())
            .unwrap()
            .unwrap();
        assert_eq!(picked.instance_id, "a2");
    }

    #[test]
    fn test_power_of_two_prefers_less_loaded() {
        let set = StrategySet::new(BalanceConfig::default());
        let mut list = candidates(&[("a1", 1), ("a2", 1)]);
        list[0].active_connections = 100;
        list[1].active_connections = 0;

        // With two candidates both are always sampled, so the idle one wins
        // every time.
        for _ in 0..20 {
            let picked = set
                .select("auth", Strategy::PowerOfTwo, &list, &ClientContext::default())
                .unwrap()
                .unwrap();
            assert_eq!(picked.instance_id, "a2");
        }
    }

    #[test]
    fn test_weighted_random_respects_weights() {
        let set = StrategySet::new(BalanceConfig::default());
        let list = candidates(&[("a1", 9), ("a2", 1)]);
        let ctx = ClientContext::default();

        let mut a1 = 0;
        for _ in 0..2_000 {
            if set
                .select("auth", Strategy::WeightedRandom, &list, &ctx)
                .unwrap()
                .unwrap()
                .instance_id
                == "a1"
            {
                a1 += 1;
            }
        }
        // Expected 1800; allow generous randomness slack.
        assert!(a1 > 1_500, "a1 picked {a1} of 2000");
    }

    #[test]
    fn test_consistent_hash_is_sticky() {
        let set = StrategySet::new(BalanceConfig::default());
        let list = candidates(&[("a1", 1), ("a2", 1), ("a3", 1)]);
        let ctx = ClientContext {
            hash_key: Some("user-42".to_string()),
            ..Default::default()
        };

        let first = set
            .select("auth", Strategy::ConsistentHash, &list, &ctx)
            .unwrap()
            .unwrap();
        for _ in 0..10 {
            let again = set
                .select("auth", Strategy::ConsistentHash, &list, &ctx)
                .unwrap()
                .unwrap();
            assert_eq!(again.instance_id, first.instance_id);
        }
    }

    #[test]
    fn test_consistent_hash_requires_key() {
        let set = StrategySet::new(BalanceConfig::default());
        let list = candidates(&[("a1", 1), ("a2", 1)]);
        let err = set
            .select("auth", Strategy::ConsistentHash, &list, &ClientContext::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_consistent_hash_survives_member_removal() {
        let set = StrategySet::new(BalanceConfig::default());
        let full = candidates(&[("a1", 1), ("a2", 1), ("a3", 1)]);
        let ctx = |key: &str| ClientContext {
            hash_key: Some(key.to_string()),
            ..Default::default()
        };

        // Keys whose owner survives keep their owner after removing a3.
        let reduced = candidates(&[("a1", 1), ("a2", 1)]);
        for i in 0..50 {
            let key = format!("key-{i}");
            let before = set
                .select("auth", Strategy::ConsistentHash, &full, &ctx(&key))
                .unwrap()
                .unwrap();
            if before.instance_id != "a3" {
                let after = set
                    .select("auth", Strategy::ConsistentHash, &reduced, &ctx(&key))
                    .unwrap()
                    .unwrap();
                assert_eq!(after.instance_id, before.instance_id);
            }
        }
    }

    #[test]
    fn test_resource_aware_picks_least_pressured() {
        let set = StrategySet::new(BalanceConfig::default());
        let mut list = candidates(&[("a1", 1), ("a2", 1)]);
        list[0].metadata.insert("cpu".to_string(), "0.9".to_string());
        list[0].metadata.insert("mem".to_string(), "0.9".to_string());
        list[1].metadata.insert("cpu".to_string(), "0.1".to_string());
        list[1].metadata.insert("mem".to_string(), "0.2".to_string());

        let picked = set
            .select("auth", Strategy::ResourceAware, &list, &ClientContext::default())
            .unwrap()
            .unwrap();
        assert_eq!(picked.instance_id, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_switches_on_variance() {
        let set = StrategySet::new(BalanceConfig::default());
        let ctx = ClientContext::default();

        // Balanced low load: behaves as weighted round-robin.
        let list = candidates(&[("a1", 1), ("a2", 1)]);
        set.select("auth", Strategy::Adaptive, &list, &ctx).unwrap();
        assert_eq!(
            set.adaptive.get("auth").unwrap().lock().current,
            Strategy::WeightedRoundRobin
        );

        // Skewed load after the re-eval interval: least-connections.
        let mut skewed = candidates(&[("a1", 1), ("a2", 1)]);
        skewed[0].active_connections = 100;
        skewed[1].active_connections = 10;
        tokio::time::advance(Duration::from_secs(31)).await;
        set.select("auth", Strategy::Adaptive, &skewed, &ctx).unwrap();
        assert_eq!(
            set.adaptive.get("auth").unwrap().lock().current,
            Strategy::LeastConnections
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_high_average_uses_power_of_two() {
        let set = StrategySet::new(BalanceConfig::default());
        let mut list = candidates(&[("a1", 1), ("a2", 1)]);
        list[0].active_connections = 150;
        list[1].active_connections = 140;

        set.select("auth", Strategy::Adaptive, &list, &ClientContext::default())
            .unwrap();
        assert_eq!(
            set.adaptive.get("auth").unwrap().lock().current,
            Strategy::PowerOfTwo
        );
    }
}
