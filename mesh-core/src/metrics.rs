//! Prometheus metrics for the mesh core.
//!
//! All metrics register against one shared registry and are exposed through
//! the control API's `/metrics` endpoint.

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry, Encoder,
    HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Resolve calls, labeled by service and strategy.
pub static REQUESTS_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        Opts::new("mesh_requests_total", "Total resolve requests"),
        &["service", "strategy"],
        REGISTRY.clone()
    )
    .expect("Failed to register REQUESTS_TOTAL")
});

/// Load-balancer errors, labeled by service and reason.
pub static LB_ERRORS_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        Opts::new("mesh_lb_errors_total", "Load balancer errors"),
        &["service", "reason"],
        REGISTRY.clone()
    )
    .expect("Failed to register LB_ERRORS_TOTAL")
});

/// Last reported health score per instance, scaled to 0-100.
pub static INSTANCE_HEALTH: std::sync::LazyLock<IntGaugeVec> = std::sync::LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        Opts::new(
            "mesh_instance_health",
            "Instance health score (0-100 scale)"
        ),
        &["service", "instance"],
        REGISTRY.clone()
    )
    .expect("Failed to register INSTANCE_HEALTH")
});

/// Resolve request duration in seconds.
pub static REQUEST_DURATION_SECONDS: std::sync::LazyLock<HistogramVec> =
    std::sync::LazyLock::new(|| {
        register_histogram_vec_with_registry!(
            prometheus::HistogramOpts::new(
                "mesh_request_duration_seconds",
                "Resolve request duration in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
            &["service"],
            REGISTRY.clone()
        )
        .expect("Failed to register REQUEST_DURATION_SECONDS")
    });

/// Active connections per instance as reported by connection tracking.
pub static ACTIVE_CONNECTIONS: std::sync::LazyLock<IntGaugeVec> = std::sync::LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        Opts::new("mesh_active_connections", "Active connections per instance"),
        &["service", "instance"],
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_CONNECTIONS")
});

/// Circuit state per instance: 0 closed, 1 open, 2 half-open.
pub static CIRCUIT_STATE: std::sync::LazyLock<IntGaugeVec> = std::sync::LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        Opts::new(
            "mesh_circuit_state",
            "Circuit state (0 closed, 1 open, 2 half-open)"
        ),
        &["service", "instance"],
        REGISTRY.clone()
    )
    .expect("Failed to register CIRCUIT_STATE")
});

/// Failed sync rounds per peer.
pub static PEER_SYNC_FAILURES_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            Opts::new("mesh_peer_sync_failures_total", "Failed peer sync rounds"),
            &["peer"],
            REGISTRY.clone()
        )
        .expect("Failed to register PEER_SYNC_FAILURES_TOTAL")
    });

/// Events dropped on overflowing subscriber queues.
pub static EVENTS_DROPPED_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            Opts::new(
                "mesh_events_dropped_total",
                "Events dropped due to subscriber queue overflow"
            ),
            &["subscriber"],
            REGISTRY.clone()
        )
        .expect("Failed to register EVENTS_DROPPED_TOTAL")
    });

/// Cache hits per tier (local, distributed, resolution).
pub static CACHE_HITS_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        Opts::new("mesh_cache_hits_total", "Cache hits per tier"),
        &["tier"],
        REGISTRY.clone()
    )
    .expect("Failed to register CACHE_HITS_TOTAL")
});

/// Cache misses per tier.
pub static CACHE_MISSES_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        Opts::new("mesh_cache_misses_total", "Cache misses per tier"),
        &["tier"],
        REGISTRY.clone()
    )
    .expect("Failed to register CACHE_MISSES_TOTAL")
});

/// SRV resolutions that returned only part of the target set.
pub static DNS_PARTIAL_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "mesh_dns_partial_total",
        "SRV resolutions with partially failed targets",
        REGISTRY.clone()
    )
    .expect("Failed to register DNS_PARTIAL_TOTAL")
});

/// Encode every registered metric in Prometheus text format.
#[must_use]
pub fn encode_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a health score as a 0-100 gauge.
pub fn set_instance_health(service: &str, instance: &str, score: f64) {
    #[allow(clippy::cast_possible_truncation)]
    let scaled = (score.clamp(0.0, 1.0) * 100.0).round() as i64;
    INSTANCE_HEALTH
        .with_label_values(&[service, instance])
        .set(scaled);
}

/// Drop per-instance series when an instance is removed.
pub fn forget_instance(service: &str, instance: &str) {
    let _ = INSTANCE_HEALTH.remove_label_values(&[service, instance]);
    let _ = ACTIVE_CONNECTIONS.remove_label_values(&[service, instance]);
    let _ = CIRCUIT_STATE.remove_label_values(&[service, instance]);
}
