//! Health check engine.
//!
//! One background task per registered probe. Consecutive failure/success
//! counters drive status transitions through the registry (single status
//! write plus event publish); a rolling outcome window derives the health
//! score. The engine never raises to callers.

mod probe;

pub use probe::{run_probe, ProbeKind, ProbeOutcome, ProbeSpec};

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mesh_core::config::HealthConfig;
use mesh_core::ServiceStatus;

use crate::registry::{EventFilter, ServiceRegistry};

/// Per-probe rolling state.
struct Counters {
    consecutive_failures: u32,
    consecutive_successes: u32,
    window: VecDeque<ProbeOutcome>,
    window_size: usize,
}

impl Counters {
    fn new(window_size: usize) -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            window: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// Record one outcome; returns the derived score and the status the
    /// instance should move to, if any.
    fn apply(&mut self, outcome: ProbeOutcome, spec: &ProbeSpec) -> (f64, Option<ServiceStatus>) {
        self.window.push_back(outcome);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let transition = match outcome {
            ProbeOutcome::Success => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                (self.consecutive_successes >= spec.healthy_after)
                    .then_some(ServiceStatus::Running)
            }
            ProbeOutcome::Failure | ProbeOutcome::Timeout => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                (self.consecutive_failures >= spec.unhealthy_after)
                    .then_some(ServiceStatus::Unhealthy)
            }
        };

        (self.score(), transition)
    }

    /// `clamp((successes - 0.5*timeouts - failures) / window, 0, 1)` over
    /// the configured window size.
    fn score(&self) -> f64 {
        let mut successes = 0.0;
        let mut failures = 0.0;
        let mut timeouts = 0.0;
        for outcome in &self.window {
            match outcome {
                ProbeOutcome::Success => successes += 1.0,
                ProbeOutcome::Failure => failures += 1.0,
                ProbeOutcome::Timeout => timeouts += 1.0,
            }
        }
        #[allow(clippy::cast_precision_loss)]
        let window = self.window_size as f64;
        ((successes - 0.5 * timeouts - failures) / window).clamp(0.0, 1.0)
    }
}

struct ProbeHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

pub struct HealthCheckEngine {
    registry: Arc<ServiceRegistry>,
    config: HealthConfig,
    http: reqwest::Client,
    probes: DashMap<String, ProbeHandle>,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
    watcher: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthCheckEngine {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, config: HealthConfig) -> Arc<Self> {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_probes));
        Arc::new(Self {
            registry,
            config,
            http: reqwest::Client::new(),
            probes: DashMap::new(),
            limiter,
            cancel: CancellationToken::new(),
            watcher: parking_lot::Mutex::new(None),
        })
    }

    /// Start the engine: watches registry events so probes die with their
    /// instances.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let subscription = {
            let mut filter = EventFilter::default();
            filter.event_types.insert("deregistered".to_string());
            engine.registry.subscribe(filter)
        };
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    event = subscription.recv() => {
                        let Some(event) = event else { return };
                        if let Some(instance_id) = event.instance_id() {
                            engine.remove(instance_id);
                        }
                    }
                }
            }
        });
        *self.watcher.lock() = Some(handle);
        info!("Health check engine started");
    }

    /// Register (or replace) the probe for an instance.
    pub fn submit(self: &Arc<Self>, instance_id: &str, spec: ProbeSpec) {
        self.remove(instance_id);

        let engine = Arc::clone(self);
        let id = instance_id.to_string();
        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let mut counters = Counters::new(engine.config.score_window);
            let mut timer = interval(spec.interval());
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => return,
                    _ = timer.tick() => {
                        engine.run_cycle(&id, &spec, &mut counters).await;
                    }
                }
            }
        });

        debug!(instance_id, "Probe submitted");
        self.probes
            .insert(instance_id.to_string(), ProbeHandle { cancel, task });
    }

    /// Drop the probe for an instance.
    pub fn remove(&self, instance_id: &str) {
        if let Some((_, handle)) = self.probes.remove(instance_id) {
            handle.cancel.cancel();
            handle.task.abort();
            debug!(instance_id, "Probe removed");
        }
    }

    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    /// Cancel every probe and the event watcher, then await them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<String> = self.probes.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.probes.remove(&id) {
                handle.cancel.cancel();
                let _ = handle.task.await;
            }
        }
        if let Some(watcher) = self.watcher.lock().take() {
            let _ = watcher.await;
        }
        info!("Health check engine stopped");
    }

    async fn run_cycle(&self, instance_id: &str, spec: &ProbeSpec, counters: &mut Counters) {
        // Stale probe backpressure: rather than queueing, a probe that cannot
        // get a permit skips this cycle.
        let Ok(_permit) = self.limiter.clone().try_acquire_owned() else {
            debug!(instance_id, "Probe skipped: concurrency limit reached");
            return;
        };

        let outcome = run_probe(&spec.kind, spec.timeout(), &self.http).await;
        let (score, transition) = counters.apply(outcome, spec);

        if let Err(e) = self.registry.update_health(instance_id, score) {
            // Instance is gone; the watcher will remove the probe shortly.
            debug!(instance_id, error = %e, "Health write skipped");
            return;
        }

        if let Some(status) = transition {
            match self.registry.update_status(instance_id, status) {
                Ok(()) => {}
                Err(mesh_core::Error::InvalidTransition { .. }) => {
                    // Lifecycle already moved on (e.g. STOPPING); leave it.
                }
                Err(e) => {
                    warn!(instance_id, error = %e, "Probe-driven status write failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::config::RegistryConfig;
    use mesh_core::ServiceInstance;

    fn spec(outcome_kind: ProbeKind, interval_ms: u64) -> ProbeSpec {
        ProbeSpec {
            kind: outcome_kind,
            interval_ms,
            timeout_ms: 200,
            unhealthy_after: 2,
            healthy_after: 2,
        }
    }

    #[test]
    fn test_score_math() {
        let mut counters = Counters::new(20);
        let probe = spec(
            ProbeKind::Tcp {
                host: "h".to_string(),
                port: 1,
            },
            1_000,
        );

        // 10 successes: (10 - 0 - 0) / 20 = 0.5
        for _ in 0..10 {
            counters.apply(ProbeOutcome::Success, &probe);
        }
        assert!((counters.score() - 0.5).abs() < 1e-9);

        // Two timeouts: (10 - 1 - 0) / 20 = 0.45
        counters.apply(ProbeOutcome::Timeout, &probe);
        counters.apply(ProbeOutcome::Timeout, &probe);
        assert!((counters.score() - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_score_never_negative() {
        let mut counters = Counters::new(4);
        let probe = spec(
            ProbeKind::Tcp {
                host: "h".to_string(),
                port: 1,
            },
            1_000,
        );
        for _ in 0..4 {
            counters.apply(ProbeOutcome::Failure, &probe);
        }
        assert!((counters.score() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_transition_thresholds() {
        let mut counters = Counters::new(20);
        let probe = spec(
            ProbeKind::Tcp {
                host: "h".to_string(),
                port: 1,
            },
            1_000,
        );

        let (_, t) = counters.apply(ProbeOutcome::Failure, &probe);
        assert!(t.is_none());
        let (_, t) = counters.apply(ProbeOutcome::Failure, &probe);
        assert_eq!(t, Some(ServiceStatus::Unhealthy));

        let (_, t) = counters.apply(ProbeOutcome::Success, &probe);
        assert!(t.is_none());
        let (_, t) = counters.apply(ProbeOutcome::Success, &probe);
        assert_eq!(t, Some(ServiceStatus::Running));
    }

    #[tokio::test]
    async fn test_probe_drives_status_through_registry() {
        let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
        registry
            .register(ServiceInstance::new("a1", "auth", "127.0.0.1", 1))
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let engine = HealthCheckEngine::new(registry.clone(), HealthConfig::default());
        engine.start();
        engine.submit(
            "a1",
            spec(
                ProbeKind::Tcp {
                    host: "127.0.0.1".to_string(),
                    port,
                },
                20,
            ),
        );

        // Two successful probes promote STARTING -> RUNNING.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(registry.get("a1").unwrap().status, ServiceStatus::Running);

        // Kill the listener: two failures mark it UNHEALTHY.
        drop(listener);
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(registry.get("a1").unwrap().status, ServiceStatus::Unhealthy);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_deregister_removes_probe() {
        let registry = Arc::new(ServiceRegistry::new(RegistryConfig {
            deregister_grace_secs: 0,
            ..RegistryConfig::default()
        }));
        registry
            .register(ServiceInstance::new("a1", "auth", "127.0.0.1", 1))
            .unwrap();
        registry.heartbeat("a1").unwrap();

        let engine = HealthCheckEngine::new(registry.clone(), HealthConfig::default());
        engine.start();
        engine.submit(
            "a1",
            spec(
                ProbeKind::Tcp {
                    host: "127.0.0.1".to_string(),
                    port: 1,
                },
                10_000,
            ),
        );
        assert_eq!(engine.probe_count(), 1);

        registry.deregister("a1", "shutdown").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(engine.probe_count(), 0);

        engine.shutdown().await;
    }
}
