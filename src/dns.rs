//! Resolve-once DNS cache backed by hickory-dns
//!
//! Once a hostname is resolved it keeps mapping to the same address for the lifetime of
//! the cache. Static overrides are consulted before the cache and never expire either.

use crate::error::{Error, Result};
use hickory_resolver::config::{NameServerConfig, NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::TokioResolver;
use moka::future::Cache;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default upstream DNS servers
pub fn default_dns_servers() -> Vec<SocketAddr> {
  vec![
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(114, 114, 114, 114)), 53),
  ]
}

/// Hostname to address cache with static overrides
#[derive(Clone)]
pub struct DnsCache {
  resolver: Arc<TokioResolver>,
  hosts: Arc<HashMap<String, IpAddr>>,
  cache: Cache<String, IpAddr>,
  lookups: Arc<AtomicUsize>,
}

impl DnsCache {
  /// Build a cache that queries `dns_servers`, or the system configuration when empty.
  ///
  /// `localhost` maps to `127.0.0.1` unless `hosts` says otherwise.
  pub fn new(dns_servers: &[SocketAddr], hosts: HashMap<String, IpAddr>) -> Result<Self> {
    let resolver = if dns_servers.is_empty() {
      TokioResolver::builder_tokio()
        .map_err(|e| Error::dns_error(format!("Failed to read system DNS config: {}", e)))?
        .build()
    } else {
      let name_servers: Vec<NameServerConfig> = dns_servers
        .iter()
        .map(|addr| NameServerConfig::new(*addr, Protocol::Udp))
        .collect();
      let group = NameServerConfigGroup::from(name_servers);
      let config = ResolverConfig::from_parts(None, vec![], group);
      TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build()
    };

    let mut overrides: HashMap<String, IpAddr> = hosts
      .into_iter()
      .map(|(h, ip)| (h.trim_end_matches('.').to_ascii_lowercase(), ip))
      .collect();
    overrides
      .entry("localhost".to_string())
      .or_insert(IpAddr::V4(Ipv4Addr::LOCALHOST));

    Ok(Self {
      resolver: Arc::new(resolver),
      hosts: Arc::new(overrides),
      cache: Cache::builder().build(),
      lookups: Arc::new(AtomicUsize::new(0)),
    })
  }

  /// Resolve `host` to a single address.
  ///
  /// IP literals are returned as-is, overrides win over lookups, and a successful lookup
  /// is pinned for every later call. Failures are not cached.
  pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
      return Ok(ip);
    }
    let key = host.trim_end_matches('.').to_ascii_lowercase();
    if let Some(ip) = self.hosts.get(&key) {
      return Ok(*ip);
    }
    self
      .cache
      .try_get_with(key.clone(), async {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let lookup = self
          .resolver
          .lookup_ip(key.as_str())
          .await
          .map_err(|e| Error::dns_error(format!("{}: {}", key, e)))?;
        let ip = lookup
          .iter()
          .next()
          .ok_or_else(|| Error::dns_error(format!("no addresses found for host: {}", key)))?;
        tracing::debug!("[MITM] resolved {} -> {}", key, ip);
        Ok::<_, Error>(ip)
      })
      .await
      .map_err(|e| Error::DnsError(e.to_string()))
  }

  /// Pin `host` to `ip` unless it is already resolved
  pub async fn seed(&self, host: &str, ip: IpAddr) {
    let key = host.trim_end_matches('.').to_ascii_lowercase();
    self.cache.entry(key).or_insert(ip).await;
  }

  /// Number of lookups that went to the network
  pub fn lookup_count(&self) -> usize {
    self.lookups.load(Ordering::SeqCst)
  }
}

impl std::fmt::Debug for DnsCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DnsCache")
      .field("hosts", &self.hosts.len())
      .field("cached", &self.cache.entry_count())
      .finish()
  }
}
