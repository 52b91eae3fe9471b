//! DNS-assisted resolution
//!
//! `ExternalName` services point at a host name rather than an address, so
//! traffic to them never matches the directory directly. When enabled, their
//! host names are forward-resolved on an interval and the resulting addresses
//! are published as a secondary index consulted after a direct miss.

use crate::k8s::directory::WorkloadDirectory;
use crate::k8s::types::Workload;
use async_trait::async_trait;
use moss_common::Ip;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<Ipv4Addr>>;
}

/// Resolver backed by the system stub resolver
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<Ipv4Addr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect())
    }
}

pub struct DnsRefresher<R> {
    directory: WorkloadDirectory,
    resolver: R,
    interval: Duration,
}

impl<R: HostResolver> DnsRefresher<R> {
    pub fn new(directory: WorkloadDirectory, resolver: R, interval: Duration) -> Self {
        Self {
            directory,
            resolver,
            interval,
        }
    }

    /// Resolve every known external name once and publish the result.
    /// Returns the number of addresses published.
    pub async fn refresh_once(&self) -> usize {
        let mut resolved = HashMap::new();

        for (key, host) in self.directory.external_names() {
            let lookup = tokio::time::timeout(LOOKUP_TIMEOUT, self.resolver.resolve(&host));
            let addrs = match lookup.await {
                Ok(Ok(addrs)) => addrs,
                Ok(Err(e)) => {
                    debug!("Could not resolve {} for {}: {}", host, key, e);
                    continue;
                }
                Err(_) => {
                    debug!("Timed out resolving {} for {}", host, key);
                    continue;
                }
            };

            for addr in addrs {
                resolved.insert(
                    Ip::from(addr),
                    Workload::service(&key.namespace, &key.name),
                );
            }
        }

        let count = resolved.len();
        self.directory.publish_dns(resolved);
        count
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("DNS-assisted resolution enabled, refreshing every {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let count = self.refresh_once().await;
                    debug!("DNS refresh published {} addresses", count);
                }
            }
        }
    }
}
