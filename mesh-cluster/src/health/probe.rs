//! Probe specifications and execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use mesh_core::config::HealthConfig;

/// What to probe and how to interpret the answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeKind {
    /// HTTP GET; success when the status is in `expected_statuses`
    /// (empty = any 2xx).
    Http {
        url: String,
        #[serde(default)]
        expected_statuses: Vec<u16>,
    },
    /// TCP connect.
    Tcp { host: String, port: u16 },
    /// Shell command; exit code 0 is success.
    Script { command: String },
    /// Redis PING.
    Redis { url: String },
    /// Elasticsearch cluster health; green and yellow pass.
    Elastic { url: String },
    /// Kafka broker reachability. `topic` and `max_lag` describe the intent
    /// for operators; without a consumer client the probe checks that every
    /// broker accepts connections.
    Kafka {
        brokers: Vec<String>,
        topic: String,
        max_lag: u64,
    },
}

/// A registered probe: the kind plus its scheduling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSpec {
    #[serde(flatten)]
    pub kind: ProbeKind,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
    #[serde(default = "default_healthy_after")]
    pub healthy_after: u32,
}

fn default_interval_ms() -> u64 {
    10_000
}
fn default_timeout_ms() -> u64 {
    3_000
}
fn default_unhealthy_after() -> u32 {
    3
}
fn default_healthy_after() -> u32 {
    2
}

impl ProbeSpec {
    /// Scheduling defaults from the health section of the mesh config.
    #[must_use]
    pub fn with_defaults(kind: ProbeKind, config: &HealthConfig) -> Self {
        Self {
            kind,
            interval_ms: config.interval_ms,
            timeout_ms: config.timeout_ms,
            unhealthy_after: config.unhealthy_after,
            healthy_after: config.healthy_after,
        }
    }

    /// Probe cadence; a zero configuration value still yields a valid
    /// (1 ms) timer period.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Result of one probe run. Timeouts count half as hard as failures in the
/// health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
    Timeout,
}

/// Run one probe under its timeout. Never returns an error: every problem
/// is a `Failure` or `Timeout` outcome.
pub async fn run_probe(
    kind: &ProbeKind,
    timeout: Duration,
    http: &reqwest::Client,
) -> ProbeOutcome {
    let attempt = probe_once(kind, http);
    match tokio::time::timeout(timeout, attempt).await {
        Ok(true) => ProbeOutcome::Success,
        Ok(false) => ProbeOutcome::Failure,
        Err(_) => ProbeOutcome::Timeout,
    }
}

async fn probe_once(kind: &ProbeKind, http: &reqwest::Client) -> bool {
    match kind {
        ProbeKind::Http {
            url,
            expected_statuses,
        } => match http.get(url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if expected_statuses.is_empty() {
                    response.status().is_success()
                } else {
                    expected_statuses.contains(&status)
                }
            }
            Err(e) => {
                debug!(url, error = %e, "HTTP probe failed");
                false
            }
        },

        ProbeKind::Tcp { host, port } => {
            tokio::net::TcpStream::connect((host.as_str(), *port))
                .await
                .is_ok()
        }

        ProbeKind::Script { command } => {
            match tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .output()
                .await
            {
                Ok(output) => output.status.success(),
                Err(e) => {
                    debug!(command, error = %e, "Script probe failed to spawn");
                    false
                }
            }
        }

        ProbeKind::Redis { url } => match redis::Client::open(url.as_str()) {
            Ok(client) => match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    matches!(
                        redis::cmd("PING").query_async::<String>(&mut conn).await,
                        Ok(ref pong) if pong == "PONG"
                    )
                }
                Err(e) => {
                    debug!(error = %e, "Redis probe connection failed");
                    false
                }
            },
            Err(_) => false,
        },

        ProbeKind::Elastic { url } => {
            let endpoint = format!("{}/_cluster/health", url.trim_end_matches('/'));
            match http.get(&endpoint).send().await {
                Ok(response) => match response.json::<serde_json::Value>().await {
                    Ok(body) => matches!(
                        body.get("status").and_then(|s| s.as_str()),
                        Some("green" | "yellow")
                    ),
                    Err(_) => false,
                },
                Err(e) => {
                    debug!(url = endpoint, error = %e, "Elasticsearch probe failed");
                    false
                }
            }
        }

        ProbeKind::Kafka { brokers, .. } => {
            if brokers.is_empty() {
                return false;
            }
            for broker in brokers {
                let Some((host, port)) = broker.rsplit_once(':') else {
                    return false;
                };
                let Ok(port) = port.parse::<u16>() else {
                    return false;
                };
                if tokio::net::TcpStream::connect((host, port)).await.is_err() {
                    return false;
                }
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_from_config() {
        let config = HealthConfig::default();
        let spec = ProbeSpec::with_defaults(
            ProbeKind::Tcp {
                host: "10.0.0.1".to_string(),
                port: 8080,
            },
            &config,
        );
        assert_eq!(spec.interval(), Duration::from_millis(config.interval_ms));
        assert_eq!(spec.unhealthy_after, config.unhealthy_after);
    }

    #[test]
    fn test_probe_spec_serde() {
        let json = r#"{"type":"http","url":"http://10.0.0.1:8080/health","expected_statuses":[200,204],"interval_ms":5000}"#;
        let spec: ProbeSpec = serde_json::from_str(json).unwrap();
        assert!(matches!(spec.kind, ProbeKind::Http { .. }));
        assert_eq!(spec.interval_ms, 5_000);
        assert_eq!(spec.timeout_ms, 3_000);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let http = reqwest::Client::new();

        let kind = ProbeKind::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        };
        assert_eq!(
            run_probe(&kind, Duration::from_secs(1), &http).await,
            ProbeOutcome::Success
        );

        drop(listener);
        assert_eq!(
            run_probe(&kind, Duration::from_secs(1), &http).await,
            ProbeOutcome::Failure
        );
    }

    #[tokio::test]
    async fn test_script_probe_exit_codes() {
        let http = reqwest::Client::new();
        assert_eq!(
            run_probe(
                &ProbeKind::Script {
                    command: "true".to_string()
                },
                Duration::from_secs(5),
                &http
            )
            .await,
            ProbeOutcome::Success
        );
        assert_eq!(
            run_probe(
                &ProbeKind::Script {
                    command: "exit 7".to_string()
                },
                Duration::from_secs(5),
                &http
            )
            .await,
            ProbeOutcome::Failure
        );
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let http = reqwest::Client::new();
        let outcome = run_probe(
            &ProbeKind::Script {
                command: "sleep 5".to_string(),
            },
            Duration::from_millis(50),
            &http,
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Timeout);
    }
}
