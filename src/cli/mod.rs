pub mod commands;

use crate::config::{Config, CredentialSource, PortRange};
use clap::{Args, Parser, Subcommand};
use ipnet::Ipv4Net;
use moss_common::Ip;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "moss")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Workload-level service graph for Kubernetes from raw connection records", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(
        short,
        long,
        global = true,
        env = "MOSS_CONFIG",
        help = "YAML configuration file"
    )]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the agent: watch the cluster, correlate records, serve metrics")]
    Run(RunArgs),
    #[command(about = "Wait for the directory to sync and print what an address resolves to")]
    Resolve {
        #[arg(help = "IPv4 address to classify")]
        ip: Ip,

        #[command(flatten)]
        args: RunArgs,
    },
}

/// Overrides applied on top of the config file
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    #[arg(long, env = "MOSS_METRICS_ADDRESS", help = "Metrics bind address")]
    pub metrics_address: Option<IpAddr>,

    #[arg(long, env = "MOSS_METRICS_PORT", help = "Metrics port")]
    pub metrics_port: Option<u16>,

    #[arg(
        long,
        env = "MOSS_RESOLVE_DNS",
        num_args = 0..=1,
        default_missing_value = "true",
        help = "Resolve ExternalName services through DNS"
    )]
    pub resolve_dns: Option<bool>,

    #[arg(long, value_enum, env = "MOSS_CREDENTIALS", help = "Cluster credential source")]
    pub credentials: Option<CredentialSource>,

    #[arg(long, env = "KUBECONFIG", help = "Kubeconfig path")]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "MOSS_CLUSTER_CIDRS",
        value_delimiter = ',',
        help = "Pod and service ranges, comma separated"
    )]
    pub cluster_cidrs: Option<Vec<Ipv4Net>>,

    #[arg(long, env = "MOSS_INGEST_ADDRESS", help = "Connection record listener")]
    pub ingest_address: Option<SocketAddr>,

    #[arg(long, env = "MOSS_WORKERS", help = "Correlator workers")]
    pub workers: Option<usize>,

    #[arg(long, env = "MOSS_IDLE_TIMEOUT", help = "Seconds before an idle connection is evicted")]
    pub idle_timeout: Option<u64>,

    #[arg(long, env = "MOSS_EPHEMERAL_PORTS", help = "Local port range, e.g. 32768-60999")]
    pub ephemeral_ports: Option<PortRange>,

    #[arg(long, env = "MOSS_READY_TIMEOUT", help = "Seconds to wait for the directory to sync")]
    pub ready_timeout: Option<u64>,
}

impl RunArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(address) = self.metrics_address {
            config.metrics_address = address;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if let Some(resolve_dns) = self.resolve_dns {
            config.resolve_dns = resolve_dns;
        }
        if let Some(credentials) = self.credentials {
            config.credentials = credentials;
        }
        if let Some(path) = &self.kubeconfig {
            config.kubeconfig = Some(path.clone());
        }
        if let Some(cidrs) = &self.cluster_cidrs {
            config.cluster_cidrs = cidrs.clone();
        }
        if let Some(address) = self.ingest_address {
            config.ingest_address = address;
        }
        if let Some(workers) = self.workers {
            config.correlator_workers = workers;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(range) = self.ephemeral_ports {
            config.ephemeral_ports = range;
        }
        if let Some(secs) = self.ready_timeout {
            config.ready_timeout_secs = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags_override_config() {
        let cli = Cli::try_parse_from([
            "moss",
            "run",
            "--metrics-port",
            "9100",
            "--resolve-dns",
            "--cluster-cidrs",
            "10.0.0.0/8,172.20.0.0/16",
            "--ephemeral-ports",
            "40000-50000",
        ])
        .unwrap();

        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };

        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.metrics_port, 9100);
        assert!(config.resolve_dns);
        assert_eq!(config.cluster_cidrs.len(), 2);
        assert_eq!(config.ephemeral_ports.start, 40000);
        assert_eq!(config.correlator_workers, 4);
    }

    #[test]
    fn test_resolve_parses_address() {
        let cli = Cli::try_parse_from(["moss", "resolve", "10.244.0.5"]).unwrap();
        let Some(Commands::Resolve { ip, .. }) = cli.command else {
            panic!("expected resolve");
        };
        assert_eq!(ip.to_string(), "10.244.0.5");
    }
}
