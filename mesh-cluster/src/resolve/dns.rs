//! SRV-based DNS resolution with a two-tier cache.
//!
//! Lookup order: in-process moka cache, optional Redis tier, then a live
//! SRV query (plus A/AAAA per target) against the configured server set,
//! cycling servers across retries with exponential backoff.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfigGroup, ResolverConfig as HickoryConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;
use redis::AsyncCommands;
use tracing::{debug, warn};

use mesh_core::config::ResolverConfig;
use mesh_core::{metrics, Error, InstanceFilter, Result, ServiceInstance, ServiceStatus};

/// Upper bound for a single DNS round trip; retry pacing is configured
/// separately.
const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

pub struct DnsResolver {
    config: ResolverConfig,
    /// One resolver per configured server so retries can cycle servers.
    servers: Vec<(String, TokioAsyncResolver)>,
    local: moka::sync::Cache<(String, u64), Arc<Vec<ServiceInstance>>>,
    distributed: Option<redis::aio::ConnectionManager>,
}

impl DnsResolver {
    /// Build the resolver set and connect the optional distributed cache
    /// tier. An unreachable Redis downgrades to two-tier-less operation.
    pub async fn new(config: ResolverConfig) -> Result<Self> {
        let mut servers = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let (ip, port) = parse_server(server)?;
            let group = NameServerConfigGroup::from_ips_clear(&[ip], port, true);
            let hickory_config = HickoryConfig::from_parts(None, vec![], group);
            let mut opts = ResolverOpts::default();
            opts.timeout = DNS_QUERY_TIMEOUT;
            opts.attempts = 1;
            opts.ip_strategy = if config.prefer_ipv6 {
                LookupIpStrategy::Ipv6thenIpv4
            } else {
                LookupIpStrategy::Ipv4thenIpv6
            };
            servers.push((
                server.clone(),
                TokioAsyncResolver::tokio(hickory_config, opts),
            ));
        }

        let distributed = if config.redis_url.is_empty() {
            None
        } else {
            match redis::Client::open(config.redis_url.clone()) {
                Ok(client) => match client.get_connection_manager().await {
                    Ok(conn) => Some(conn),
                    Err(e) => {
                        warn!(error = %e, "Distributed DNS cache unavailable, continuing without it");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Invalid Redis URL for distributed DNS cache");
                    None
                }
            }
        };

        let local = moka::sync::Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(config.local_ttl_secs))
            .build();

        Ok(Self {
            config,
            servers,
            local,
            distributed,
        })
    }

    /// Resolve instances for `service`, filtered, through the cache tiers.
    pub async fn resolve(
        &self,
        service: &str,
        filter: &InstanceFilter,
    ) -> Result<Vec<ServiceInstance>> {
        let key = (service.to_string(), filter.filter_hash());

        if let Some(cached) = self.local.get(&key) {
            metrics::CACHE_HITS_TOTAL.with_label_values(&["local"]).inc();
            return Ok(cached.as_ref().clone());
        }
        metrics::CACHE_MISSES_TOTAL
            .with_label_values(&["local"])
            .inc();

        if let Some(instances) = self.distributed_get(&key).await {
            metrics::CACHE_HITS_TOTAL
                .with_label_values(&["distributed"])
                .inc();
            self.local.insert(key, Arc::new(instances.clone()));
            return Ok(instances);
        }
        metrics::CACHE_MISSES_TOTAL
            .with_label_values(&["distributed"])
            .inc();

        let resolved = self.lookup_srv(service).await?;
        let matched: Vec<ServiceInstance> = resolved
            .into_iter()
            .filter(|inst| filter.matches(inst))
            .collect();

        self.local.insert(key.clone(), Arc::new(matched.clone()));
        self.distributed_put(&key, &matched).await;
        Ok(matched)
    }

    /// Live SRV resolution with server cycling and exponential backoff.
    async fn lookup_srv(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        if self.servers.is_empty() {
            return Err(Error::NoResolution(service.to_string()));
        }

        let name = format!("_{}._tcp.{}.", service, self.config.srv_domain);
        let attempts = self.config.retries.max(1) as usize;
        let mut delay = Duration::from_millis(self.config.backoff_base_ms);
        let cap = Duration::from_millis(self.config.backoff_cap_ms);

        for attempt in 0..attempts {
            let (label, resolver) = &self.servers[attempt % self.servers.len()];
            match self.query_once(resolver, service, &name).await {
                Ok(instances) if !instances.is_empty() => return Ok(instances),
                Ok(_) => {
                    debug!(service, server = %label, "SRV lookup returned no usable targets");
                }
                Err(e) => {
                    warn!(service, server = %label, error = %e, "SRV lookup failed");
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(cap);
            }
        }

        Err(Error::NoResolution(service.to_string()))
    }

    async fn query_once(
        &self,
        resolver: &TokioAsyncResolver,
        service: &str,
        name: &str,
    ) -> Result<Vec<ServiceInstance>> {
        let srv = resolver
            .srv_lookup(name)
            .await
            .map_err(|e| Error::NoResolution(format!("{name}: {e}")))?;

        let mut instances = Vec::new();
        let mut failed_targets = 0usize;
        for record in srv.iter() {
            let host = record.target().to_utf8();
            let host = host.trim_end_matches('.');
            match resolver.lookup_ip(host).await {
                Ok(ips) => {
                    let Some(ip) = pick_ip(ips.iter().collect(), self.config.prefer_ipv6) else {
                        failed_targets += 1;
                        continue;
                    };
                    instances.push(srv_instance(
                        service,
                        host,
                        &ip,
                        record.port(),
                        record.weight(),
                    ));
                }
                Err(e) => {
                    failed_targets += 1;
                    warn!(service, target = host, error = %e, "SRV target did not resolve");
                }
            }
        }

        if failed_targets > 0 && !instances.is_empty() {
            // Partial result: hand back what resolved and let operators know.
            metrics::DNS_PARTIAL_TOTAL.inc();
        }
        Ok(instances)
    }

    async fn distributed_get(&self, key: &(String, u64)) -> Option<Vec<ServiceInstance>> {
        let conn = self.distributed.as_ref()?;
        let mut conn = conn.clone();
        match conn
            .get::<_, Option<String>>(redis_key(&key.0, key.1))
            .await
        {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "Distributed DNS cache read failed");
                None
            }
        }
    }

    async fn distributed_put(&self, key: &(String, u64), instances: &[ServiceInstance]) {
        let Some(conn) = self.distributed.as_ref() else {
            return;
        };
        let Ok(json) = serde_json::to_string(instances) else {
            return;
        };
        let mut conn = conn.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(redis_key(&key.0, key.1), json, self.config.dist_ttl_secs)
            .await
        {
            debug!(error = %e, "Distributed DNS cache write failed");
        }
    }
}

fn redis_key(service: &str, filter_hash: u64) -> String {
    format!("mesh:dns:{service}:{filter_hash:016x}")
}

fn parse_server(server: &str) -> Result<(IpAddr, u16)> {
    if let Ok(addr) = server.parse::<std::net::SocketAddr>() {
        return Ok((addr.ip(), addr.port()));
    }
    server
        .parse::<IpAddr>()
        .map(|ip| (ip, 53))
        .map_err(|_| Error::Configuration(format!("invalid DNS server address '{server}'")))
}

fn pick_ip(ips: Vec<IpAddr>, prefer_ipv6: bool) -> Option<IpAddr> {
    let preferred = ips
        .iter()
        .find(|ip| ip.is_ipv6() == prefer_ipv6)
        .copied();
    preferred.or_else(|| ips.first().copied())
}

/// Instance shape for a DNS-discovered endpoint. DNS can only attest
/// liveness, so the record enters as `RUNNING` with a neutral health score.
fn srv_instance(
    service: &str,
    host: &str,
    ip: &IpAddr,
    port: u16,
    srv_weight: u16,
) -> ServiceInstance {
    let mut instance = ServiceInstance::new(
        &format!("dns:{host}:{port}"),
        service,
        &ip.to_string(),
        port,
    )
    .with_weight(u32::from(srv_weight.max(1)));
    instance.status = ServiceStatus::Running;
    instance
        .metadata
        .insert("source".to_string(), "dns".to_string());
    instance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_forms() {
        assert_eq!(
            parse_server("10.0.0.53:5353").unwrap(),
            ("10.0.0.53".parse::<IpAddr>().unwrap(), 5353)
        );
        assert_eq!(
            parse_server("10.0.0.53").unwrap(),
            ("10.0.0.53".parse::<IpAddr>().unwrap(), 53)
        );
        assert!(parse_server("dns.example.com").is_err());
    }

    #[test]
    fn test_pick_ip_family_preference() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        let v6: IpAddr = "::1".parse().unwrap();

        assert_eq!(pick_ip(vec![v4, v6], false), Some(v4));
        assert_eq!(pick_ip(vec![v4, v6], true), Some(v6));
        // Fallback to the other family when the preferred one is absent.
        assert_eq!(pick_ip(vec![v4], true), Some(v4));
        assert_eq!(pick_ip(vec![], false), None);
    }

    #[test]
    fn test_srv_instance_shape() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        let inst = srv_instance("auth", "auth-1.mesh.local", &ip, 8080, 0);
        assert_eq!(inst.instance_id, "dns:auth-1.mesh.local:8080");
        assert_eq!(inst.address, "10.0.0.7");
        assert_eq!(inst.status, ServiceStatus::Running);
        // SRV weight 0 still yields a usable selection weight.
        assert_eq!(inst.weight, 1);
        assert_eq!(inst.metadata.get("source"), Some(&"dns".to_string()));
    }

    #[tokio::test]
    async fn test_no_servers_yields_no_resolution() {
        let resolver = DnsResolver::new(ResolverConfig::default()).await.unwrap();
        let err = resolver
            .resolve("auth", &InstanceFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoResolution(_)));
    }

    #[test]
    fn test_redis_key_is_stable() {
        assert_eq!(
            redis_key("auth", 0xdead_beef),
            "mesh:dns:auth:00000000deadbeef"
        );
    }
}
