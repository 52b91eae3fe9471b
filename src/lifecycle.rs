//! Lifecycle orchestration
//!
//! Starts the directory, the metrics endpoint and the record pipeline in that
//! order, tracks every background task, and tears them down on shutdown.
//! Readiness comes from the directory itself; nothing here waits on a timer
//! to decide the system is warm.

use crate::aggregator::GraphAggregator;
use crate::config::Config;
use crate::correlator::Correlator;
use crate::k8s::{
    ClusterWatcher, DirectoryWriter, DnsRefresher, SystemResolver, WorkloadDirectory,
    WorkloadEvent,
};
use crate::metrics::{MetricsServer, PrometheusExporter};
use crate::source::ConnectionSource;
use crate::{MossError, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

const EVENT_QUEUE: usize = 4096;
const RECORD_QUEUE: usize = 8192;

pub struct Moss {
    config: Config,
    directory: WorkloadDirectory,
    writer: Option<DirectoryWriter>,
    aggregator: GraphAggregator,
    correlator: Correlator,
    cancel: CancellationToken,
    tracker: TaskTracker,
    fatal_tx: mpsc::Sender<MossError>,
    fatal_rx: mpsc::Receiver<MossError>,
}

impl Moss {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let (directory, writer) = WorkloadDirectory::new(config.cluster_cidrs.clone());
        let aggregator = GraphAggregator::new(config.idle_timeout());
        let correlator = Correlator::new(
            directory.clone(),
            aggregator.clone(),
            config.ephemeral_ports,
        );
        let (fatal_tx, fatal_rx) = mpsc::channel(4);

        Ok(Self {
            config,
            directory,
            writer: Some(writer),
            aggregator,
            correlator,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            fatal_tx,
            fatal_rx,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn directory(&self) -> WorkloadDirectory {
        self.directory.clone()
    }

    pub fn aggregator(&self) -> GraphAggregator {
        self.aggregator.clone()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the directory writer on an existing event stream, for callers
    /// that feed cluster state from somewhere other than the API server
    pub fn start_directory_writer(&mut self, events: mpsc::Receiver<WorkloadEvent>) -> Result<()> {
        let writer = self
            .writer
            .take()
            .ok_or(MossError::AlreadyStarted("directory"))?;

        self.tracker.spawn(writer.run(events, self.cancel.clone()));
        self.spawn_ready_watch();
        Ok(())
    }

    /// Watch the cluster and keep the directory current
    pub fn start_directory(&mut self, client: kube::Client) -> Result<()> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        self.start_directory_writer(events_rx)?;

        let watcher = ClusterWatcher::new(client, events_tx, self.config.max_watch_failures);
        self.spawn_critical("cluster watcher", watcher.run(self.cancel.clone()));

        if self.config.resolve_dns {
            let refresher = DnsRefresher::new(
                self.directory.clone(),
                SystemResolver,
                self.config.dns_refresh_interval(),
            );
            self.tracker.spawn(refresher.run(self.cancel.clone()));
        }

        Ok(())
    }

    /// Source -> correlator workers -> aggregator, plus the eviction sweep
    pub fn start_pipeline(&self, source: Box<dyn ConnectionSource>) {
        let (records_tx, records_rx) = mpsc::channel(RECORD_QUEUE);

        self.tracker.spawn(
            self.aggregator
                .clone()
                .run_sweeper(self.config.sweep_interval(), self.cancel.clone()),
        );
        self.tracker.spawn(self.correlator.clone().run(
            records_rx,
            self.config.correlator_workers,
            self.cancel.clone(),
        ));
        self.spawn_logged("connection source", source.run(records_tx, self.cancel.clone()));
    }

    /// Bind and serve the metrics endpoint. Returns the bound address.
    pub async fn start_metrics(&self) -> Result<SocketAddr> {
        let exporter = Arc::new(PrometheusExporter::new(
            self.directory.clone(),
            self.aggregator.clone(),
            self.correlator.stats(),
            self.config.snapshot_timeout(),
        ));

        let server =
            MetricsServer::bind(self.config.metrics_addr(), exporter, self.directory.clone())
                .await?;
        let addr = server.local_addr()?;

        self.spawn_logged("metrics server", server.run(self.cancel.clone()));
        Ok(addr)
    }

    pub async fn start(
        &mut self,
        client: kube::Client,
        source: Box<dyn ConnectionSource>,
    ) -> Result<()> {
        info!("Starting moss v{}", crate::VERSION);

        self.start_directory(client)?;
        self.start_metrics().await?;
        self.start_pipeline(source);

        info!("moss started, waiting for the directory to sync");
        Ok(())
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.directory.wait_ready())
            .await
            .map_err(|_| MossError::NotReady(timeout))
    }

    /// Run until `shutdown` resolves or a critical task fails, then stop.
    /// Returns the failure, if that is what ended the run.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
            Some(e) = self.fatal_rx.recv() => Err(e),
        };

        self.stop().await;
        outcome
    }

    /// Cancel every task and wait for them, up to the shutdown grace period
    pub async fn stop(&self) {
        info!("Stopping moss...");
        self.cancel.cancel();
        self.tracker.close();

        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "{} tasks still running after {:?}, abandoning them",
                self.tracker.len(),
                grace
            );
        }

        info!("moss stopped");
    }

    /// A task whose failure means the process can no longer be trusted
    fn spawn_critical<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let fatal = self.fatal_tx.clone();
        self.tracker.spawn(async move {
            if let Err(e) = task.await {
                error!("{} failed: {}", name, e);
                let _ = fatal.send(e).await;
            }
        });
    }

    fn spawn_logged<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tracker.spawn(async move {
            if let Err(e) = task.await {
                error!("{} stopped: {}", name, e);
            }
        });
    }

    fn spawn_ready_watch(&self) {
        let directory = self.directory.clone();
        let timeout = self.config.ready_timeout();
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = tokio::time::timeout(timeout, directory.wait_ready()) => match result {
                    Ok(()) => info!("Directory ready"),
                    Err(_) => warn!(
                        "Directory still syncing after {:?}, lookups keep reporting not ready",
                        timeout
                    ),
                },
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::ResourceKind;
    use crate::source::ChannelSource;

    fn test_config() -> Config {
        Config {
            metrics_address: "127.0.0.1".parse().unwrap(),
            metrics_port: 0,
            shutdown_grace_secs: 5,
            ..Config::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = Config {
            correlator_workers: 0,
            ..Config::default()
        };
        assert!(matches!(Moss::new(config), Err(MossError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_writer_starts_once() {
        let mut moss = Moss::new(test_config()).unwrap();
        let (_tx, rx) = mpsc::channel(1);
        moss.start_directory_writer(rx).unwrap();

        let (_tx2, rx2) = mpsc::channel(1);
        assert!(matches!(
            moss.start_directory_writer(rx2),
            Err(MossError::AlreadyStarted(_))
        ));
        moss.stop().await;
    }

    #[tokio::test]
    async fn test_readiness_follows_relists() {
        let mut moss = Moss::new(test_config()).unwrap();
        let (tx, rx) = mpsc::channel(16);
        moss.start_directory_writer(rx).unwrap();

        assert!(matches!(
            moss.wait_ready(Duration::from_millis(50)).await,
            Err(MossError::NotReady(_))
        ));

        for kind in ResourceKind::ALL {
            tx.send(WorkloadEvent::RelistStarted(kind)).await.unwrap();
            tx.send(WorkloadEvent::RelistCompleted(kind)).await.unwrap();
        }

        moss.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert!(moss.directory().is_ready());
        moss.stop().await;
    }

    #[tokio::test]
    async fn test_critical_failure_ends_run() {
        let moss = Moss::new(test_config()).unwrap();
        moss.spawn_critical("cluster watcher", async {
            Err(MossError::WatchFailed {
                kind: "Pod",
                failures: 10,
                last_error: "connection refused".to_string(),
            })
        });

        let result = moss.run_until(std::future::pending()).await;
        assert!(matches!(result, Err(MossError::WatchFailed { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_tasks() {
        let mut moss = Moss::new(test_config()).unwrap();
        let (_events, rx) = mpsc::channel(1);
        moss.start_directory_writer(rx).unwrap();
        moss.start_metrics().await.unwrap();

        let (_records, source) = ChannelSource::channel(1);
        moss.start_pipeline(Box::new(source));

        let cancel = moss.cancellation_token();
        tokio::time::timeout(Duration::from_secs(10), moss.run_until(async {}))
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
    }
}
