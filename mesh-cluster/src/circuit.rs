//! Per-target circuit breakers.
//!
//! One breaker per `(service, instance)` gates outbound calls. Trips on
//! consecutive failures or on window error rate, fails fast while open,
//! allows a bounded number of half-open probes, and escalates the open
//! cooldown on every re-open episode.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use mesh_core::config::CircuitConfig;
use mesh_core::{metrics, Error, Result};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    const fn metric_value(self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

/// Invoked on every state transition, outside the breaker lock.
pub type TransitionCallback = Arc<dyn Fn(&str, &str, CircuitState) + Send + Sync>;

struct Inner {
    state: CircuitState,
    /// Rolling outcome window, `true` = success.
    window: VecDeque<bool>,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_inflight: u32,
    opened_at: Instant,
    current_open_timeout: Duration,
}

pub struct CircuitBreaker {
    service: String,
    instance_id: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
    callback: Option<TransitionCallback>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(
        service: &str,
        instance_id: &str,
        config: CircuitConfig,
        callback: Option<TransitionCallback>,
    ) -> Self {
        let open_timeout = Duration::from_secs(config.open_timeout_secs);
        Self {
            service: service.to_string(),
            instance_id: instance_id.to_string(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_inflight: 0,
                opened_at: Instant::now(),
                current_open_timeout: open_timeout,
            }),
            callback: None,
        }
        .with_callback(callback)
    }

    fn with_callback(mut self, callback: Option<TransitionCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Non-mutating admission check used during candidate filtering.
    /// An open breaker whose cooldown has elapsed reports `true` so the
    /// instance can be offered as a half-open probe.
    #[must_use]
    pub fn allows_request(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.opened_at.elapsed() >= inner.current_open_timeout,
            CircuitState::HalfOpen => {
                inner.half_open_inflight < self.config.half_open_max_probes
            }
        }
    }

    /// Acquire permission to call the target. Callers must follow up with
    /// `record_success` or `record_failure`.
    pub fn try_acquire(&self) -> Result<()> {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => None,
                CircuitState::Open => {
                    if inner.opened_at.elapsed() >= inner.current_open_timeout {
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_successes = 0;
                        inner.half_open_inflight = 1;
                        Some(CircuitState::HalfOpen)
                    } else {
                        return Err(self.open_error());
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_inflight < self.config.half_open_max_probes {
                        inner.half_open_inflight += 1;
                        None
                    } else {
                        return Err(self.open_error());
                    }
                }
            }
        };

        if let Some(state) = transition {
            self.announce(state);
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            self.push_outcome(&mut inner, true);
            inner.consecutive_failures = 0;

            match inner.state {
                CircuitState::HalfOpen => {
                    inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold {
                        inner.state = CircuitState::Closed;
                        inner.window.clear();
                        inner.half_open_successes = 0;
                        inner.half_open_inflight = 0;
                        // Recovery resets the cooldown escalation.
                        inner.current_open_timeout =
                            Duration::from_secs(self.config.open_timeout_secs);
                        Some(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::Closed | CircuitState::Open => None,
            }
        };

        if let Some(state) = transition {
            self.announce(state);
        }
    }

    pub fn record_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            self.push_outcome(&mut inner, false);
            inner.consecutive_failures += 1;

            match inner.state {
                CircuitState::Closed => {
                    if self.should_trip(&inner) {
                        self.open(&mut inner, false);
                        Some(CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    // A failed probe re-opens with an escalated cooldown.
                    inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                    inner.half_open_successes = 0;
                    self.open(&mut inner, true);
                    Some(CircuitState::Open)
                }
                CircuitState::Open => None,
            }
        };

        if let Some(state) = transition {
            self.announce(state);
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Window error rate; 0 when empty.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.window.is_empty() {
            return 0.0;
        }
        let failures = inner.window.iter().filter(|ok| !**ok).count();
        #[allow(clippy::cast_precision_loss)]
        {
            failures as f64 / inner.window.len() as f64
        }
    }

    fn push_outcome(&self, inner: &mut Inner, success: bool) {
        inner.window.push_back(success);
        while inner.window.len() > self.config.window_size {
            inner.window.pop_front();
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        if inner.consecutive_failures >= self.config.failure_threshold {
            return true;
        }
        if inner.window.len() >= self.config.min_throughput {
            let failures = inner.window.iter().filter(|ok| !**ok).count();
            #[allow(clippy::cast_precision_loss)]
            let rate = failures as f64 / inner.window.len() as f64;
            return rate > self.config.error_rate_threshold;
        }
        false
    }

    fn open(&self, inner: &mut Inner, escalate: bool) {
        if escalate {
            let cap = Duration::from_secs(self.config.max_open_timeout_secs);
            let escalated = inner.current_open_timeout.mul_f64(self.config.cooldown_factor);
            inner.current_open_timeout = escalated.min(cap);
        }
        inner.state = CircuitState::Open;
        inner.opened_at = Instant::now();
        warn!(
            service = %self.service,
            instance_id = %self.instance_id,
            cooldown_secs = inner.current_open_timeout.as_secs(),
            "Circuit opened"
        );
    }

    fn open_error(&self) -> Error {
        Error::CircuitOpen {
            service: self.service.clone(),
            instance_id: self.instance_id.clone(),
        }
    }

    fn announce(&self, state: CircuitState) {
        metrics::CIRCUIT_STATE
            .with_label_values(&[&self.service, &self.instance_id])
            .set(state.metric_value());
        debug!(
            service = %self.service,
            instance_id = %self.instance_id,
            state = state.as_str(),
            "Circuit state changed"
        );
        if let Some(callback) = &self.callback {
            callback(&self.service, &self.instance_id, state);
        }
    }
}

/// All breakers, keyed by `(service, instance_id)`.
pub struct CircuitBreakerRegistry {
    config: CircuitConfig,
    breakers: DashMap<(String, String), Arc<CircuitBreaker>>,
    callback: Option<TransitionCallback>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            callback: None,
        }
    }

    #[must_use]
    pub fn with_transition_callback(mut self, callback: TransitionCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn breaker(&self, service: &str, instance_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry((service.to_string(), instance_id.to_string()))
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    instance_id,
                    self.config.clone(),
                    self.callback.clone(),
                ))
            })
            .clone()
    }

    /// Admission check without creating a breaker for untracked targets.
    #[must_use]
    pub fn allows(&self, service: &str, instance_id: &str) -> bool {
        self.breakers
            .get(&(service.to_string(), instance_id.to_string()))
            .is_none_or(|b| b.allows_request())
    }

    /// Acquire through an existing breaker. Targets without a breaker have
    /// never failed and pass freely.
    pub fn try_acquire_existing(&self, service: &str, instance_id: &str) -> Result<()> {
        match self
            .breakers
            .get(&(service.to_string(), instance_id.to_string()))
        {
            Some(breaker) => breaker.try_acquire(),
            None => Ok(()),
        }
    }

    pub fn report(&self, service: &str, instance_id: &str, success: bool) {
        let breaker = self.breaker(service, instance_id);
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    /// Drop breakers for a removed instance.
    pub fn purge_instance(&self, instance_id: &str) {
        self.breakers.retain(|(_, id), _| id != instance_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
