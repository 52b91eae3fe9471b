use crate::aggregator::{GraphAggregator, LinkSnapshot};
use crate::correlator::CorrelatorStats;
use crate::k8s::{Readiness, WorkloadDirectory};
use crate::Result;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

const LINK_LABELS: [&str; 8] = [
    "client_kind",
    "client_namespace",
    "client_name",
    "server_kind",
    "server_namespace",
    "server_name",
    "server_port",
    "role",
];

/// Renders directory and graph state in the Prometheus text format.
///
/// Every scrape builds a fresh registry from the current state, so edges that
/// were evicted simply stop appearing.
pub struct PrometheusExporter {
    directory: WorkloadDirectory,
    aggregator: GraphAggregator,
    records: Arc<CorrelatorStats>,
    snapshot_timeout: Duration,
    last_snapshot: RwLock<Arc<Vec<LinkSnapshot>>>,
    stale_snapshots: AtomicU64,
}

impl PrometheusExporter {
    pub fn new(
        directory: WorkloadDirectory,
        aggregator: GraphAggregator,
        records: Arc<CorrelatorStats>,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            aggregator,
            records,
            snapshot_timeout,
            last_snapshot: RwLock::new(Arc::new(Vec::new())),
            stale_snapshots: AtomicU64::new(0),
        }
    }

    /// Current graph, or the previous one when a fresh copy does not arrive
    /// within the snapshot timeout
    pub async fn snapshot(&self) -> Arc<Vec<LinkSnapshot>> {
        let aggregator = self.aggregator.clone();
        let task = tokio::task::spawn_blocking(move || aggregator.snapshot());

        match tokio::time::timeout(self.snapshot_timeout, task).await {
            Ok(Ok(links)) => {
                let links = Arc::new(links);
                *self.last_snapshot.write().await = links.clone();
                links
            }
            Ok(Err(e)) => {
                warn!("Graph snapshot failed: {}, serving previous", e);
                self.stale_snapshots.fetch_add(1, Ordering::Relaxed);
                self.last_snapshot.read().await.clone()
            }
            Err(_) => {
                warn!(
                    "Graph snapshot took longer than {:?}, serving previous",
                    self.snapshot_timeout
                );
                self.stale_snapshots.fetch_add(1, Ordering::Relaxed);
                self.last_snapshot.read().await.clone()
            }
        }
    }

    pub async fn format_current_metrics(&self) -> Result<String> {
        let links = self.snapshot().await;
        let registry = self.build_registry(&links)?;

        let mut buffer = String::new();
        TextEncoder::new().encode_utf8(&registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    fn build_registry(&self, links: &[LinkSnapshot]) -> Result<Registry> {
        let registry = Registry::new();

        let bytes_sent = IntCounterVec::new(
            Opts::new(
                "moss_link_bytes_sent_total",
                "Bytes sent from client to server over the link",
            ),
            &LINK_LABELS,
        )?;
        let bytes_received = IntCounterVec::new(
            Opts::new(
                "moss_link_bytes_received_total",
                "Bytes sent from server back to client over the link",
            ),
            &LINK_LABELS,
        )?;
        let active = IntGaugeVec::new(
            Opts::new(
                "moss_link_active",
                "1 while at least one contributing connection is open",
            ),
            &LINK_LABELS,
        )?;
        let connections = IntGaugeVec::new(
            Opts::new(
                "moss_link_connections",
                "Connections currently contributing to the link",
            ),
            &LINK_LABELS,
        )?;

        for snapshot in links {
            let link = &snapshot.link;
            let client_name = link.client.name();
            let server_name = link.server.name();
            let port = link.server_port.to_string();

            let labels = [
                link.client.kind().as_str(),
                link.client.namespace(),
                client_name.as_ref(),
                link.server.kind().as_str(),
                link.server.namespace(),
                server_name.as_ref(),
                port.as_str(),
                link.role.as_str(),
            ];

            bytes_sent
                .with_label_values(&labels)
                .inc_by(snapshot.bytes_sent);
            bytes_received
                .with_label_values(&labels)
                .inc_by(snapshot.bytes_received);
            active
                .with_label_values(&labels)
                .set(i64::from(snapshot.active));
            connections
                .with_label_values(&labels)
                .set(snapshot.connections as i64);
        }

        registry.register(Box::new(bytes_sent))?;
        registry.register(Box::new(bytes_received))?;
        registry.register(Box::new(active))?;
        registry.register(Box::new(connections))?;

        let link_count = IntGauge::new("moss_links", "Live links in the graph")?;
        link_count.set(links.len() as i64);
        registry.register(Box::new(link_count))?;

        let entries = IntGauge::new(
            "moss_directory_entries",
            "Addresses with a known owning workload",
        )?;
        entries.set(self.directory.len() as i64);
        registry.register(Box::new(entries))?;

        let ready = IntGauge::new(
            "moss_directory_ready",
            "1 once every watched resource kind completed its initial list",
        )?;
        ready.set(i64::from(self.directory.readiness() == Readiness::Ready));
        registry.register(Box::new(ready))?;

        let dns_entries = IntGauge::new(
            "moss_directory_dns_entries",
            "Addresses resolved from ExternalName services",
        )?;
        dns_entries.set(self.directory.dns_entries() as i64);
        registry.register(Box::new(dns_entries))?;

        self.register_counter(
            &registry,
            "moss_lookups_before_ready_total",
            "Lookups answered before the directory was ready",
            self.directory.lookups_before_ready(),
        )?;
        self.register_counter(
            &registry,
            "moss_records_total",
            "Connection records folded into the graph",
            self.records.accepted(),
        )?;

        let rejected = IntCounterVec::new(
            Opts::new(
                "moss_records_rejected_total",
                "Connection records discarded, by reason",
            ),
            &["reason"],
        )?;
        for (reason, count) in self.records.rejections() {
            rejected.with_label_values(&[reason]).inc_by(count);
        }
        registry.register(Box::new(rejected))?;

        self.register_counter(
            &registry,
            "moss_counter_resets_total",
            "Connection byte counters that went backwards and were rebaselined",
            self.aggregator.counter_resets(),
        )?;
        self.register_counter(
            &registry,
            "moss_contributions_evicted_total",
            "Connection contributions evicted as inactive or idle",
            self.aggregator.evictions(),
        )?;
        self.register_counter(
            &registry,
            "moss_duplicate_records_total",
            "Late refreshes of evicted connections repeating their last totals",
            self.aggregator.duplicates(),
        )?;
        self.register_counter(
            &registry,
            "moss_stale_snapshots_total",
            "Scrapes served from the previous graph snapshot",
            self.stale_snapshots.load(Ordering::Relaxed),
        )?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(registry)
    }

    fn register_counter(
        &self,
        registry: &Registry,
        name: &str,
        help: &str,
        value: u64,
    ) -> Result<()> {
        let counter = IntCounter::new(name, help)?;
        counter.inc_by(value);
        registry.register(Box::new(counter))?;
        Ok(())
    }
}
