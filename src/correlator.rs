//! Connection correlator
//!
//! Turns raw connection records into workload-level observations. Both ends
//! of the tuple are resolved through the directory without waiting on it;
//! an address the directory cannot place is still forwarded as `Unknown` or
//! `External` so the edge is visible and upgrades once the directory catches
//! up.
//!
//! Records are sharded across workers by connection key, so every refresh of
//! one connection is applied by the same worker in arrival order.

use crate::aggregator::GraphAggregator;
use crate::config::PortRange;
use crate::k8s::{Workload, WorkloadDirectory, WorkloadKind};
use crate::model::{
    ConnectionKey, ConnectionRecord, ConnectionRole, NetworkLink, Observation, Throughput,
};
use moss_common::ConnectionTuple;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

const WORKER_QUEUE: usize = 1024;

/// Why a record was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRejection {
    ZeroTuple,
    UnspecifiedAddress,
    /// Neither connection id nor pid set
    MissingIds,
    InvalidRole(u32),
    /// The transport could not decode the record at all
    Undecodable,
}

impl RecordRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordRejection::ZeroTuple => "zero_tuple",
            RecordRejection::UnspecifiedAddress => "unspecified_address",
            RecordRejection::MissingIds => "missing_ids",
            RecordRejection::InvalidRole(_) => "invalid_role",
            RecordRejection::Undecodable => "undecodable",
        }
    }
}

/// Record counters, shared with the ingestion transport and the exporter
#[derive(Debug, Default)]
pub struct CorrelatorStats {
    accepted: AtomicU64,
    zero_tuple: AtomicU64,
    unspecified_address: AtomicU64,
    missing_ids: AtomicU64,
    invalid_role: AtomicU64,
    undecodable: AtomicU64,
}

impl CorrelatorStats {
    fn counter(&self, reason: RecordRejection) -> &AtomicU64 {
        match reason {
            RecordRejection::ZeroTuple => &self.zero_tuple,
            RecordRejection::UnspecifiedAddress => &self.unspecified_address,
            RecordRejection::MissingIds => &self.missing_ids,
            RecordRejection::InvalidRole(_) => &self.invalid_role,
            RecordRejection::Undecodable => &self.undecodable,
        }
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, reason: RecordRejection) {
        self.counter(reason).fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self, reason: RecordRejection) -> u64 {
        self.counter(reason).load(Ordering::Relaxed)
    }

    /// Rejection counts keyed by reason label
    pub fn rejections(&self) -> Vec<(&'static str, u64)> {
        [
            RecordRejection::ZeroTuple,
            RecordRejection::UnspecifiedAddress,
            RecordRejection::MissingIds,
            RecordRejection::InvalidRole(0),
            RecordRejection::Undecodable,
        ]
        .into_iter()
        .map(|reason| (reason.as_str(), self.rejected(reason)))
        .collect()
    }
}

#[derive(Clone)]
pub struct Correlator {
    directory: WorkloadDirectory,
    aggregator: GraphAggregator,
    ephemeral_ports: PortRange,
    stats: Arc<CorrelatorStats>,
}

impl Correlator {
    pub fn new(
        directory: WorkloadDirectory,
        aggregator: GraphAggregator,
        ephemeral_ports: PortRange,
    ) -> Self {
        Self {
            directory,
            aggregator,
            ephemeral_ports,
            stats: Arc::new(CorrelatorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CorrelatorStats> {
        self.stats.clone()
    }

    /// Resolve one record into an observation oriented from the client side
    pub fn correlate(&self, record: &ConnectionRecord) -> Result<Observation, RecordRejection> {
        let identifier = &record.identifier;
        let tuple = identifier.tuple;

        if tuple.is_zero() {
            return Err(RecordRejection::ZeroTuple);
        }
        if tuple.src().is_unspecified() || tuple.dst().is_unspecified() {
            return Err(RecordRejection::UnspecifiedAddress);
        }
        if identifier.id == 0 && identifier.pid == 0 {
            return Err(RecordRejection::MissingIds);
        }
        let reported = ConnectionRole::from_raw(identifier.role)
            .ok_or(RecordRejection::InvalidRole(identifier.role))?;

        let source = self.directory.resolve(tuple.src());
        let destination = self.directory.resolve(tuple.dst());

        let role = match reported {
            ConnectionRole::Unknown => self.infer_role(&tuple, &source, &destination),
            known => known,
        };

        let stats = record.stats;
        let (link, throughput) = match role {
            // The observing process accepted the connection: the local end
            // (source) is the server
            ConnectionRole::Server => (
                NetworkLink {
                    client: destination,
                    server: source,
                    server_port: tuple.src_port,
                    role,
                },
                Throughput {
                    bytes_sent: stats.bytes_received,
                    bytes_received: stats.bytes_sent,
                    active: stats.active(),
                },
            ),
            ConnectionRole::Client | ConnectionRole::Unknown => (
                NetworkLink {
                    client: source,
                    server: destination,
                    server_port: tuple.dst_port,
                    role,
                },
                Throughput {
                    bytes_sent: stats.bytes_sent,
                    bytes_received: stats.bytes_received,
                    active: stats.active(),
                },
            ),
        };

        Ok(Observation {
            connection: ConnectionKey::from(identifier),
            link,
            throughput,
        })
    }

    /// Side of the flow the local process is on, from what the record offers.
    /// Stays `Unknown` unless one signal is conclusive.
    fn infer_role(
        &self,
        tuple: &ConnectionTuple,
        source: &Workload,
        destination: &Workload,
    ) -> ConnectionRole {
        let src_service = source.kind() == WorkloadKind::Service;
        let dst_service = destination.kind() == WorkloadKind::Service;

        match (src_service, dst_service) {
            (false, true) => return ConnectionRole::Client,
            (true, false) => return ConnectionRole::Server,
            _ => {}
        }

        let src_ephemeral = self.ephemeral_ports.contains(tuple.src_port);
        let dst_ephemeral = self.ephemeral_ports.contains(tuple.dst_port);

        match (src_ephemeral, dst_ephemeral) {
            (true, false) => ConnectionRole::Client,
            (false, true) => ConnectionRole::Server,
            _ => ConnectionRole::Unknown,
        }
    }

    /// Correlate and fold one record. Returns whether it was accepted.
    pub fn process(&self, record: ConnectionRecord) -> bool {
        match self.correlate(&record) {
            Ok(observation) => {
                trace!("Observed {}", observation.link);
                self.stats.record_accepted();
                self.aggregator.upsert(observation);
                true
            }
            Err(reason) => {
                debug!(
                    "Discarding record (conn {}, pid {}): {:?}",
                    record.identifier.id, record.identifier.pid, reason
                );
                self.stats.record_rejected(reason);
                false
            }
        }
    }

    /// Consume records until the channel closes or `cancel` fires. Records
    /// already handed to a worker are applied before this returns.
    pub async fn run(
        self,
        mut records: mpsc::Receiver<ConnectionRecord>,
        workers: usize,
        cancel: CancellationToken,
    ) {
        let workers = workers.max(1);
        info!("Correlator started with {} workers", workers);

        let mut shards = Vec::with_capacity(workers);
        let mut tasks = JoinSet::new();

        for _ in 0..workers {
            let (tx, mut rx) = mpsc::channel::<ConnectionRecord>(WORKER_QUEUE);
            let worker = self.clone();
            tasks.spawn(async move {
                while let Some(record) = rx.recv().await {
                    worker.process(record);
                }
            });
            shards.push(tx);
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                record = records.recv() => {
                    let Some(record) = record else {
                        debug!("Connection record channel closed");
                        break;
                    };

                    let shard = shard_for(&ConnectionKey::from(&record.identifier), workers);
                    if shards[shard].send(record).await.is_err() {
                        error!("Correlator worker {} exited early", shard);
                        break;
                    }
                }
            }
        }

        drop(shards);
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Correlator worker failed: {}", e);
            }
        }

        info!(
            "Correlator stopped. {} records accepted",
            self.stats.accepted()
        );
    }
}

fn shard_for(key: &ConnectionKey, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}
