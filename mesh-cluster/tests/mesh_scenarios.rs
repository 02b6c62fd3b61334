//! End-to-end scenarios across registry, resolution, balancing, circuits
//! and peer sync.

use std::sync::Arc;
use std::time::Duration;

use mesh_core::config::{BalanceConfig, CircuitConfig, RegistryConfig, ResolutionConfig, SyncConfig};
use mesh_core::{ClientContext, InstanceFilter, ServiceInstance, ServiceStatus, Strategy};
use mesh_cluster::registry::EventFilter;
use mesh_cluster::{
    CircuitBreakerRegistry, ResolutionEngine, ServiceRegistry, StrategySet,
};

fn no_cache() -> ResolutionConfig {
    ResolutionConfig {
        cache_ttl_ms: 0,
        min_health: 0.5,
    }
}

fn build_engine(
    registry: &Arc<ServiceRegistry>,
    circuit: CircuitConfig,
    resolution: ResolutionConfig,
) -> Arc<ResolutionEngine> {
    ResolutionEngine::new(
        registry.clone(),
        None,
        Arc::new(CircuitBreakerRegistry::new(circuit)),
        Arc::new(StrategySet::new(BalanceConfig::default())),
        resolution,
        Strategy::RoundRobin,
    )
}

fn add_running(registry: &ServiceRegistry, id: &str, weight: u32, region: &str) {
    registry
        .register(
            ServiceInstance::new(id, "auth", "10.0.0.1", 8080)
                .with_weight(weight)
                .with_region(region),
        )
        .unwrap();
    registry.heartbeat(id).unwrap();
    registry.update_health(id, 1.0).unwrap();
}

/// Scenario 1: register, heartbeat, resolve.
#[tokio::test]
async fn register_then_resolve() {
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
    let engine = build_engine(&registry, CircuitConfig::default(), no_cache());

    registry
        .register(ServiceInstance::new("a1", "auth", "10.0.0.1", 8080))
        .unwrap();
    registry.heartbeat("a1").unwrap();

    let resolved = engine
        .resolve(
            "auth",
            &InstanceFilter::default(),
            Some(Strategy::RoundRobin),
            &ClientContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(resolved.instance_id, "a1");
    assert_eq!(resolved.endpoint(), "10.0.0.1:8080");
}

/// Scenario 2: round-robin fairness over three equal instances.
#[tokio::test]
async fn round_robin_fairness() {
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
    let engine = build_engine(&registry, CircuitConfig::default(), no_cache());
    for id in ["a1", "a2", "a3"] {
        add_running(&registry, id, 1, "us-east");
    }

    let mut sequence = Vec::new();
    for _ in 0..6 {
        sequence.push(
            engine
                .resolve("auth", &InstanceFilter::default(), None, &ClientContext::default())
                .await
                .unwrap()
                .instance_id,
        );
    }
    assert_eq!(sequence, ["a1", "a2", "a3", "a1", "a2", "a3"]);
}

/// Scenario 3: circuit trips, fails over, half-opens and recovers.
#[tokio::test(start_paused = true)]
async fn circuit_trips_and_recovers() {
    let circuit = CircuitConfig {
        failure_threshold: 3,
        success_threshold: 1,
        open_timeout_secs: 60,
        ..CircuitConfig::default()
    };
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
    let engine = build_engine(&registry, circuit, no_cache());
    add_running(&registry, "a1", 1, "us-east");

    for _ in 0..3 {
        engine.report_outcome("auth", "a1", false);
    }

    // Only instance has an open circuit: nothing to resolve.
    let err = engine
        .resolve("auth", &InstanceFilter::default(), None, &ClientContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, mesh_core::Error::NoCandidates(_)));

    // A second instance keeps the service available.
    add_running(&registry, "a2", 1, "us-east");
    for _ in 0..3 {
        let resolved = engine
            .resolve("auth", &InstanceFilter::default(), None, &ClientContext::default())
            .await
            .unwrap();
        assert_eq!(resolved.instance_id, "a2");
    }

    // After the open timeout the circuit admits a half-open probe, so a1
    // becomes resolvable again.
    tokio::time::advance(Duration::from_secs(61)).await;
    let mut saw_a1 = false;
    for _ in 0..4 {
        let resolved = engine
            .resolve("auth", &InstanceFilter::default(), None, &ClientContext::default())
            .await
            .unwrap();
        if resolved.instance_id == "a1" {
            saw_a1 = true;
            break;
        }
    }
    assert!(saw_a1, "half-open probe never offered a1");

    // One success (success_threshold = 1) closes the circuit for good.
    engine.report_outcome("auth", "a1", true);
    let mut a1_picks = 0;
    for _ in 0..6 {
        if engine
            .resolve("auth", &InstanceFilter::default(), None, &ClientContext::default())
            .await
            .unwrap()
            .instance_id
            == "a1"
        {
            a1_picks += 1;
        }
    }
    assert!(a1_picks >= 2, "closed circuit should share load again");
}

/// Scenario 4: exact weighted distribution over 4000 picks.
#[tokio::test]
async fn weighted_round_robin_distribution() {
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
    let engine = build_engine(&registry, CircuitConfig::default(), no_cache());
    add_running(&registry, "a1", 3, "us-east");
    add_running(&registry, "a2", 1, "us-east");

    let mut a1 = 0;
    let mut a2 = 0;
    for _ in 0..4_000 {
        match engine
            .resolve(
                "auth",
                &InstanceFilter::default(),
                Some(Strategy::WeightedRoundRobin),
                &ClientContext::default(),
            )
            .await
            .unwrap()
            .instance_id
            .as_str()
        {
            "a1" => a1 += 1,
            "a2" => a2 += 1,
            other => panic!("unexpected instance {other}"),
        }
    }
    assert_eq!(a1, 3_000);
    assert_eq!(a2, 1_000);
}

/// Scenario 5: two nodes pull each other's snapshots and converge to equal
/// state hashes.
#[tokio::test]
async fn peer_sync_convergence() {
    let node_x = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
    let node_y = Arc::new(ServiceRegistry::new(RegistryConfig::default()));

    node_x
        .register(ServiceInstance::new("a1", "auth", "10.0.0.1", 8080))
        .unwrap();
    node_x.heartbeat("a1").unwrap();
    node_y
        .register(ServiceInstance::new("a2", "auth", "10.0.0.2", 8080))
        .unwrap();
    node_y.heartbeat("a2").unwrap();
    assert_ne!(node_x.state_hash(), node_y.state_hash());

    // Interval 1: each node pulls the other's state.
    let from_y = mesh_cluster::registry::snapshot_decode(&node_y.snapshot().unwrap()).unwrap();
    node_x.merge_remote(from_y.instances, "node-y", false);
    let from_x = mesh_cluster::registry::snapshot_decode(&node_x.snapshot().unwrap()).unwrap();
    node_y.merge_remote(from_x.instances, "node-x", false);

    // Interval 2: a second pull settles any asymmetry from interval 1.
    let from_y = mesh_cluster::registry::snapshot_decode(&node_y.snapshot().unwrap()).unwrap();
    node_x.merge_remote(from_y.instances, "node-y", false);

    assert_eq!(node_x.instance_count(), 2);
    assert_eq!(node_y.instance_count(), 2);
    assert_eq!(node_x.state_hash(), node_y.state_hash());

    // Equal hashes mean a further sync mutates nothing.
    let before = node_x.state_hash();
    let from_y = mesh_cluster::registry::snapshot_decode(&node_y.snapshot().unwrap()).unwrap();
    let outcome = node_x.merge_remote(from_y.instances, "node-y", false);
    assert!(!outcome.changed());
    assert_eq!(node_x.state_hash(), before);
}

/// Scenario 6: NEAREST keeps traffic in the caller's region until it empties.
#[tokio::test]
async fn nearest_region_preference() {
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
    let engine = build_engine(&registry, CircuitConfig::default(), no_cache());
    add_running(&registry, "a1", 1, "us-east");
    add_running(&registry, "a2", 1, "us-east");
    add_running(&registry, "a3", 1, "eu-west");

    let ctx = ClientContext {
        region: Some("us-east".to_string()),
        ..Default::default()
    };
    for _ in 0..10 {
        let resolved = engine
            .resolve("auth", &InstanceFilter::default(), Some(Strategy::Nearest), &ctx)
            .await
            .unwrap();
        assert!(["a1", "a2"].contains(&resolved.instance_id.as_str()));
    }

    registry.update_status("a1", ServiceStatus::Unhealthy).unwrap();
    registry.update_status("a2", ServiceStatus::Unhealthy).unwrap();
    let resolved = engine
        .resolve("auth", &InstanceFilter::default(), Some(Strategy::Nearest), &ctx)
        .await
        .unwrap();
    assert_eq!(resolved.instance_id, "a3");
}

/// Once every instance is unhealthy, resolution fails within one cache
/// TTL (here: immediately after the invalidation event is processed).
#[tokio::test]
async fn all_unhealthy_yields_no_candidates_within_ttl() {
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
    let engine = build_engine(
        &registry,
        CircuitConfig::default(),
        ResolutionConfig {
            cache_ttl_ms: 2_000,
            min_health: 0.5,
        },
    );
    let cancel = tokio_util::sync::CancellationToken::new();
    let task = engine.spawn_invalidation_task(cancel.clone());

    add_running(&registry, "a1", 1, "us-east");
    engine
        .resolve("auth", &InstanceFilter::default(), None, &ClientContext::default())
        .await
        .unwrap();

    registry.update_status("a1", ServiceStatus::Unhealthy).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = engine
        .resolve("auth", &InstanceFilter::default(), None, &ClientContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, mesh_core::Error::NoCandidates(_)));

    cancel.cancel();
    let _ = task.await;
}

/// Subscribers observe the full ordered lifecycle of an instance.
#[tokio::test]
async fn subscriber_sees_ordered_lifecycle() {
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig {
        deregister_grace_secs: 0,
        ..RegistryConfig::default()
    }));
    let sub = registry.subscribe(EventFilter::for_service("auth"));

    registry
        .register(ServiceInstance::new("a1", "auth", "10.0.0.1", 8080))
        .unwrap();
    registry.heartbeat("a1").unwrap();
    registry.deregister("a1", "shutdown").unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut types = Vec::new();
    let mut edges = Vec::new();
    while let Some(event) = sub.try_recv() {
        types.push(event.event_type());
        if let mesh_core::RegistryEvent::StatusChanged { from, to, .. } = event {
            edges.push((from, to));
        }
    }
    assert_eq!(types.first(), Some(&"registered"));
    assert_eq!(types.last(), Some(&"deregistered"));
    for (from, to) in edges {
        assert!(from.can_transition_to(to), "illegal observed edge {from} -> {to}");
    }
}

/// Boundary: one instance, every strategy returns it; zero instances, every
/// strategy errors with NoCandidates.
#[tokio::test]
async fn strategy_boundaries_through_engine() {
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
    let engine = build_engine(&registry, CircuitConfig::default(), no_cache());
    add_running(&registry, "only", 1, "us-east");

    let ctx = ClientContext {
        hash_key: Some("k".to_string()),
        region: Some("us-east".to_string()),
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
        Strategy::Nearest,
    ] {
        let resolved = engine
            .resolve("auth", &InstanceFilter::default(), Some(strategy), &ctx)
            .await
            .unwrap();
        assert_eq!(resolved.instance_id, "only", "strategy {}", strategy.name());
    }

    for strategy in [Strategy::RoundRobin, Strategy::ConsistentHash] {
        let err = engine
            .resolve("ghost", &InstanceFilter::default(), Some(strategy), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, mesh_core::Error::NoCandidates(_)));
    }
}

/// Sync config knob: version-first conflict resolution.
#[tokio::test]
async fn sync_prefer_version_knob() {
    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
    let mut local = ServiceInstance::new("a1", "auth", "10.0.0.1", 8080).with_version("2.0.0");
    local.status = ServiceStatus::Running;
    registry.register(local).unwrap();
    registry.heartbeat("a1").unwrap();

    let mut remote = registry.get("a1").unwrap();
    remote.version = "1.9.0".to_string();
    remote.last_heartbeat_at = remote.last_heartbeat_at + chrono::Duration::seconds(120);

    let outcome = registry.merge_remote(vec![remote], "peer", true);
    assert_eq!(outcome.conflicts, 1);
    assert_eq!(registry.get("a1").unwrap().version, "2.0.0");

    // The default SyncConfig keeps heartbeat precedence.
    assert!(!SyncConfig::default().prefer_version);
}
