//! Mesh node configuration.
//!
//! One `MeshConfig` enumerates every tunable. Values come from an optional
//! YAML file plus the documented `MESH_*` environment overrides; unknown
//! file keys are rejected at load time.

use std::path::Path;

use config::{Config as ConfigBuilder, ConfigError, File};
use serde::{Deserialize, Serialize};

/// Top-level configuration for a mesh node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub health: HealthConfig,
    pub resolver: ResolverConfig,
    pub resolution: ResolutionConfig,
    pub balance: BalanceConfig,
    pub circuit: CircuitConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the control API binds to.
    pub bind_addr: String,
    /// Datacenter / region label attached to this node.
    pub datacenter: String,
    /// Directory for persisted registry snapshots. Empty disables persistence.
    pub state_dir: String,
    /// Seconds between periodic snapshot writes (0 disables the periodic loop;
    /// shutdown still writes one).
    pub snapshot_interval_secs: u64,
    /// Deadline for cooperative shutdown of background tasks.
    pub shutdown_deadline_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7400".to_string(),
            datacenter: String::new(),
            state_dir: String::new(),
            snapshot_interval_secs: 60,
            shutdown_deadline_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Heartbeat TTL before an instance is forced `UNHEALTHY`.
    pub ttl_secs: u64,
    /// Sweeper cadence.
    pub cleanup_interval_secs: u64,
    /// Additional grace after TTL expiry before removal.
    pub expiry_grace_secs: u64,
    /// Grace window between STOPPING and STOPPED on deregister.
    pub deregister_grace_secs: u64,
    /// Per-subscriber event queue bound; overflow drops oldest.
    pub event_queue_bound: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 90,
            cleanup_interval_secs: 30,
            expiry_grace_secs: 300,
            deregister_grace_secs: 5,
            event_queue_bound: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Default probe interval.
    pub interval_ms: u64,
    /// Default probe timeout.
    pub timeout_ms: u64,
    /// Consecutive failures before `UNHEALTHY`.
    pub unhealthy_after: u32,
    /// Consecutive successes before `RUNNING`.
    pub healthy_after: u32,
    /// Rolling sample window for the health score.
    pub score_window: usize,
    /// Upper bound on concurrently running probes.
    pub max_concurrent_probes: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            timeout_ms: 3_000,
            unhealthy_after: 3,
            healthy_after: 2,
            score_window: 20,
            max_concurrent_probes: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    /// DNS servers ("ip:port") queried for SRV records. Empty disables the
    /// DNS tier entirely (registry-only resolution).
    pub servers: Vec<String>,
    /// Domain under which `_{service}._tcp.{domain}` SRV names live.
    pub srv_domain: String,
    pub local_ttl_secs: u64,
    pub dist_ttl_secs: u64,
    /// Redis URL for the distributed cache tier. Empty disables the tier.
    pub redis_url: String,
    pub retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Prefer IPv6 targets over IPv4 when both resolve.
    pub prefer_ipv6: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            srv_domain: "mesh.local".to_string(),
            local_ttl_secs: 5,
            dist_ttl_secs: 60,
            redis_url: String::new(),
            retries: 3,
            backoff_base_ms: 100,
            backoff_cap_ms: 2_000,
            prefer_ipv6: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolutionConfig {
    /// TTL of the (service, filter) candidate cache. Zero disables caching.
    pub cache_ttl_ms: u64,
    /// Instances below this score are excluded from resolution.
    pub min_health: f64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 2_000,
            min_health: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalanceConfig {
    /// Strategy used when a resolve call does not name one.
    pub default_strategy: String,
    /// Virtual nodes per instance on consistent-hash rings.
    pub virtual_nodes: usize,
    /// Adaptive strategy re-evaluation cadence.
    pub adaptive_reeval_secs: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            default_strategy: "round_robin".to_string(),
            virtual_nodes: 160,
            adaptive_reeval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_secs: u64,
    pub window_size: usize,
    pub error_rate_threshold: f64,
    pub min_throughput: usize,
    pub cooldown_factor: f64,
    /// Cap on escalated open timeouts.
    pub max_open_timeout_secs: u64,
    pub half_open_max_probes: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_secs: 60,
            window_size: 10,
            error_rate_threshold: 0.5,
            min_throughput: 5,
            cooldown_factor: 2.0,
            max_open_timeout_secs: 3_600,
            half_open_max_probes: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Peer base URLs ("http://host:port").
    pub peers: Vec<String>,
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    /// Consecutive failed rounds before a peer is quarantined.
    pub failure_limit: u32,
    pub quarantine_secs: u64,
    /// Bodies at or above this size are zlib-compressed.
    pub compression_threshold_bytes: usize,
    /// Shared secret sent and checked as `x-mesh-secret`. Empty disables
    /// the check.
    pub secret: String,
    /// Resolve merge conflicts by version before heartbeat recency.
    pub prefer_version: bool,
    /// Refuse to start unless at least one peer answers within the boot
    /// grace period.
    pub mandatory: bool,
    pub boot_grace_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            interval_secs: 15,
            request_timeout_secs: 5,
            max_retries: 3,
            backoff_base_ms: 100,
            failure_limit: 5,
            quarantine_secs: 300,
            compression_threshold_bytes: 4 * 1024,
            secret: String::new(),
            prefer_version: false,
            mandatory: false,
            boot_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty".
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl MeshConfig {
    /// Load configuration from an optional YAML file, then apply the
    /// documented `MESH_*` environment overrides.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if !Path::new(path).exists() {
                return Err(ConfigError::Message(format!(
                    "config file '{path}' does not exist"
                )));
            }
            builder = builder.add_source(File::new(path, config::FileFormat::Yaml));
        }

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Environment variables take precedence over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("MESH_BIND_ADDR") {
            if !addr.is_empty() {
                self.server.bind_addr = addr;
            }
        }
        if let Ok(peers) = std::env::var("MESH_PEERS") {
            if !peers.is_empty() {
                self.sync.peers = peers
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(ToString::to_string)
                    .collect();
            }
        }
        if let Ok(dc) = std::env::var("MESH_DATACENTER") {
            if !dc.is_empty() {
                self.server.datacenter = dc;
            }
        }
        if let Ok(dir) = std::env::var("MESH_STATE_DIR") {
            if !dir.is_empty() {
                self.server.state_dir = dir;
            }
        }
        if let Ok(level) = std::env::var("MESH_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(ms) = std::env::var("MESH_HEALTH_INTERVAL_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.health.interval_ms = ms;
            }
        }
    }

    /// Fail-fast validation. Returns every violation, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "server.bind_addr '{}' is not a valid socket address",
                self.server.bind_addr
            ));
        }
        if self.registry.ttl_secs == 0 {
            errors.push("registry.ttl_secs must be greater than 0".to_string());
        }
        if self.registry.cleanup_interval_secs == 0 {
            errors.push("registry.cleanup_interval_secs must be greater than 0".to_string());
        }
        if self.registry.event_queue_bound == 0 {
            errors.push("registry.event_queue_bound must be greater than 0".to_string());
        }
        if self.health.interval_ms == 0 {
            errors.push("health.interval_ms must be greater than 0".to_string());
        }
        if self.health.score_window == 0 {
            errors.push("health.score_window must be greater than 0".to_string());
        }
        for server in &self.resolver.servers {
            if server.parse::<std::net::SocketAddr>().is_err()
                && server.parse::<std::net::IpAddr>().is_err()
            {
                errors.push(format!(
                    "resolver.servers entry '{server}' is not an ip or ip:port"
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.resolution.min_health) {
            errors.push(format!(
                "resolution.min_health must be within [0,1], got {}",
                self.resolution.min_health
            ));
        }
        if self.balance.virtual_nodes == 0 {
            errors.push("balance.virtual_nodes must be greater than 0".to_string());
        }
        if crate::models::strategy_names()
            .iter()
            .all(|n| *n != self.balance.default_strategy)
        {
            errors.push(format!(
                "balance.default_strategy '{}' is not a known strategy",
                self.balance.default_strategy
            ));
        }
        if self.circuit.failure_threshold == 0 || self.circuit.success_threshold == 0 {
            errors.push("circuit thresholds must be greater than 0".to_string());
        }
        if self.circuit.window_size == 0 {
            errors.push("circuit.window_size must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.circuit.error_rate_threshold) {
            errors.push(format!(
                "circuit.error_rate_threshold must be within [0,1], got {}",
                self.circuit.error_rate_threshold
            ));
        }
        if self.circuit.cooldown_factor < 1.0 {
            errors.push("circuit.cooldown_factor must be at least 1.0".to_string());
        }
        for peer in &self.sync.peers {
            if !peer.starts_with("http://") && !peer.starts_with("https://") {
                errors.push(format!("sync.peers entry '{peer}' must be an http(s) URL"));
            }
        }
        if self.sync.interval_secs == 0 {
            errors.push("sync.interval_secs must be greater than 0".to_string());
        }
        if self.sync.mandatory && self.sync.peers.is_empty() {
            errors.push("sync.mandatory requires at least one sync.peers entry".to_string());
        }
        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => errors.push(format!("logging.format must be json or pretty, got '{other}'")),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let cfg = MeshConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.registry.ttl_secs, 90);
        assert_eq!(cfg.circuit.open_timeout_secs, 60);
        assert_eq!(cfg.sync.compression_threshold_bytes, 4096);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "registry:\n  ttl_secs: 120\n  made_up_knob: true").unwrap();
        let err = MeshConfig::load(file.path().to_str()).unwrap_err();
        assert!(err.to_string().contains("made_up_knob"), "got: {err}");
    }

    #[test]
    fn test_file_values_applied() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            "server:\n  bind_addr: 127.0.0.1:9000\nsync:\n  peers:\n    - http://peer-a:7400"
        )
        .unwrap();
        let cfg = MeshConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.sync.peers, vec!["http://peer-a:7400".to_string()]);
        // Untouched sections keep defaults
        assert_eq!(cfg.registry.expiry_grace_secs, 300);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut cfg = MeshConfig::default();
        cfg.server.bind_addr = "not-an-addr".to_string();
        cfg.circuit.error_rate_threshold = 3.0;
        cfg.sync.peers = vec!["peer-a:7400".to_string()];
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(MeshConfig::load(Some("/nonexistent/mesh.yaml")).is_err());
    }
}
