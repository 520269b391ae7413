use anyhow::Result;
use async_std::net::ToSocketAddrs;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<Ipv4Addr>>;
}

/// Resolves through the host's configured resolver.
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        let addrs = (host, 80).to_socket_addrs().await?;
        let mut ips: Vec<Ipv4Addr> = addrs
            .filter_map(|a| match a.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

/// Resolved addresses, each entry valid for the configured TTL.
pub struct DnsCache {
    entries: DashMap<String, (Vec<Ipv4Addr>, Instant)>,
    ttl: Duration,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        DnsCache {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, host: &str) -> Option<Vec<Ipv4Addr>> {
        {
            let entry = self.entries.get(host)?;
            let (ips, expiry) = entry.value();
            if Instant::now() < *expiry {
                return Some(ips.clone());
            }
        }
        self.entries.remove(host);
        None
    }

    pub fn insert(&self, host: &str, ips: Vec<Ipv4Addr>) {
        self.insert_with_ttl(host, ips, self.ttl);
    }

    /// Seed an entry with its own lifetime, e.g. the TTL of the DNS answer.
    pub fn insert_with_ttl(&self, host: &str, ips: Vec<Ipv4Addr>, ttl: Duration) {
        self.entries
            .insert(host.to_string(), (ips, Instant::now() + ttl));
    }
}

/// The host part of a redirect URL: "http://portal.example.com:8080/x" gives
/// "portal.example.com".
pub fn url_host(url: &str) -> &str {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or(rest);
    authority.split(':').next().unwrap_or(authority)
}
