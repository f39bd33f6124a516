//! DNS resolution for upstream candidates.
//!
//! `client.dnsServer` picks a well-known resolver preset, the system
//! configuration, or an explicit resolver list. Hosts that are already
//! IPv4 literals skip the lookup.

use std::net::{IpAddr, Ipv4Addr};

use anyhow::Context;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

use growgate_core::config::DnsServer;

pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    pub fn new(server: &DnsServer) -> anyhow::Result<Self> {
        let inner = match server {
            DnsServer::Cloudflare => {
                TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default())
            }
            DnsServer::Google => {
                TokioAsyncResolver::tokio(ResolverConfig::google(), ResolverOpts::default())
            }
            DnsServer::Quad9 => {
                TokioAsyncResolver::tokio(ResolverConfig::quad9(), ResolverOpts::default())
            }
            DnsServer::System => TokioAsyncResolver::tokio_from_system_conf()
                .context("read system resolver configuration")?,
            DnsServer::Custom(addrs) => TokioAsyncResolver::tokio(
                ResolverConfig::from_parts(
                    None,
                    Vec::new(),
                    NameServerConfigGroup::from_ips_clear(addrs, 53, true),
                ),
                ResolverOpts::default(),
            ),
        };
        Ok(Self { inner })
    }

    /// Up to `limit` IPv4 addresses for `host`, empty on failure.
    pub async fn ipv4(&self, host: &str, limit: usize) -> Vec<Ipv4Addr> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return vec![ip];
        }
        match self.inner.lookup_ip(host).await {
            Ok(lookup) => lookup
                .iter()
                .filter_map(|addr| match addr {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .take(limit)
                .collect(),
            Err(err) => {
                tracing::warn!("resolver.lookup_failed host={host} error={err}");
                Vec::new()
            }
        }
    }
}
