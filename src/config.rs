//! Runtime configuration
//!
//! Defaults live here; a YAML file (`--config`) may override them and CLI
//! flags / environment variables override the file.

use crate::{MossError, Result};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Where the Kubernetes client takes its credentials from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialSource {
    /// In-cluster when `KUBERNETES_SERVICE_HOST` is set, kubeconfig otherwise
    #[default]
    Auto,
    InCluster,
    Kubeconfig,
}

/// Inclusive local port range the kernel hands out to outgoing connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        // net.ipv4.ip_local_port_range default
        Self {
            start: 32768,
            end: 60999,
        }
    }
}

impl FromStr for PortRange {
    type Err = MossError;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| MossError::ConfigError(format!("invalid port range '{}'", s)))?;
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|e| MossError::ConfigError(format!("invalid port '{}': {}", p, e)))
        };
        let range = PortRange {
            start: parse(start)?,
            end: parse(end)?,
        };
        if range.start > range.end {
            return Err(MossError::ConfigError(format!(
                "port range '{}' is inverted",
                s
            )));
        }
        Ok(range)
    }
}

impl TryFrom<String> for PortRange {
    type Error = MossError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub metrics_address: IpAddr,
    pub metrics_port: u16,
    pub resolve_dns: bool,
    pub credentials: CredentialSource,
    pub kubeconfig: Option<PathBuf>,
    /// Pod and service ranges; unmapped addresses inside them are `Unknown`
    pub cluster_cidrs: Vec<Ipv4Net>,
    pub ingest_address: SocketAddr,
    pub correlator_workers: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub dns_refresh_interval_secs: u64,
    pub ephemeral_ports: PortRange,
    pub max_watch_failures: u32,
    pub ready_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub snapshot_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metrics_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            metrics_port: 7117,
            resolve_dns: false,
            credentials: CredentialSource::Auto,
            kubeconfig: None,
            cluster_cidrs: default_cluster_cidrs(),
            ingest_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 7118)),
            correlator_workers: 4,
            idle_timeout_secs: 30,
            sweep_interval_secs: 5,
            dns_refresh_interval_secs: 60,
            ephemeral_ports: PortRange::default(),
            max_watch_failures: 10,
            ready_timeout_secs: 60,
            shutdown_grace_secs: 10,
            snapshot_timeout_ms: 2000,
        }
    }
}

/// RFC 1918 plus the shared address space some CNIs allocate pods from
pub fn default_cluster_cidrs() -> Vec<Ipv4Net> {
    [
        (Ipv4Addr::new(10, 0, 0, 0), 8),
        (Ipv4Addr::new(172, 16, 0, 0), 12),
        (Ipv4Addr::new(192, 168, 0, 0), 16),
        (Ipv4Addr::new(100, 64, 0, 0), 10),
    ]
    .into_iter()
    .filter_map(|(addr, prefix)| Ipv4Net::new(addr, prefix).ok())
    .collect()
}

impl Config {
    /// Load a YAML config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MossError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| MossError::ConfigError(format!("invalid config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.correlator_workers == 0 {
            return Err(MossError::ConfigError(
                "correlator_workers must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(MossError::ConfigError(
                "idle_timeout_secs and sweep_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.resolve_dns && self.dns_refresh_interval_secs == 0 {
            return Err(MossError::ConfigError(
                "dns_refresh_interval_secs must be non-zero when resolve_dns is set".to_string(),
            ));
        }
        if self.max_watch_failures == 0 {
            return Err(MossError::ConfigError(
                "max_watch_failures must be at least 1".to_string(),
            ));
        }
        if self.ephemeral_ports.start > self.ephemeral_ports.end {
            return Err(MossError::ConfigError(format!(
                "ephemeral port range {} is inverted",
                self.ephemeral_ports
            )));
        }
        Ok(())
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.metrics_address, self.metrics_port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn dns_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.dns_refresh_interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.metrics_addr().port(), 7117);
        assert_eq!(config.cluster_cidrs.len(), 4);
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = Config::from_yaml(
            "resolve_dns: true\n\
             metrics_port: 9100\n\
             credentials: in-cluster\n\
             cluster_cidrs: [\"10.96.0.0/12\"]\n\
             ephemeral_ports: \"40000-50000\"\n",
        )
        .unwrap();

        assert!(config.resolve_dns);
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.credentials, CredentialSource::InCluster);
        assert_eq!(config.cluster_cidrs.len(), 1);
        assert_eq!(config.ephemeral_ports, PortRange { start: 40000, end: 50000 });
        assert_eq!(config.idle_timeout_secs, 30);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Config::from_yaml("metrics_prot: 1\n").unwrap_err();
        assert!(err.to_string().contains("metrics_prot"));
    }

    #[test]
    fn test_port_range_parse() {
        assert!("60000-1000".parse::<PortRange>().is_err());
        assert!("abc".parse::<PortRange>().is_err());

        let range: PortRange = "1024-2048".parse().unwrap();
        assert!(range.contains(1024));
        assert!(range.contains(2048));
        assert!(!range.contains(2049));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = Config {
            correlator_workers: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(MossError::ConfigError(_))));
    }
}
