//! Connection record sources
//!
//! The capture mechanism is external. Records reach the correlator through a
//! [`ConnectionSource`]: either newline-delimited JSON over TCP, or an
//! in-process channel when moss is embedded next to the capture code.

use crate::correlator::{CorrelatorStats, RecordRejection};
use crate::model::ConnectionRecord;
use crate::{MossError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest accepted record line
const MAX_LINE_LENGTH: usize = 64 * 1024;

#[async_trait]
pub trait ConnectionSource: Send {
    /// Push records into `sink` until cancelled or the source is exhausted
    async fn run(
        self: Box<Self>,
        sink: mpsc::Sender<ConnectionRecord>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Records handed over in-process
pub struct ChannelSource {
    records: mpsc::Receiver<ConnectionRecord>,
}

impl ChannelSource {
    pub fn new(records: mpsc::Receiver<ConnectionRecord>) -> Self {
        Self { records }
    }

    pub fn channel(capacity: usize) -> (mpsc::Sender<ConnectionRecord>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl ConnectionSource for ChannelSource {
    async fn run(
        self: Box<Self>,
        sink: mpsc::Sender<ConnectionRecord>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut records = self.records;
        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => break,
                record = records.recv() => record,
            };

            let Some(record) = record else {
                debug!("Record channel closed");
                break;
            };
            if sink.send(record).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// TCP listener accepting newline-delimited JSON [`ConnectionRecord`]s
pub struct SocketSource {
    listener: TcpListener,
    stats: Arc<CorrelatorStats>,
}

impl SocketSource {
    pub async fn bind(addr: SocketAddr, stats: Arc<CorrelatorStats>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MossError::IngestError(format!("Failed to bind {}: {}", addr, e)))?;
        Ok(Self { listener, stats })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl ConnectionSource for SocketSource {
    async fn run(
        self: Box<Self>,
        sink: mpsc::Sender<ConnectionRecord>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("Accepting connection records on {}", self.local_addr()?);

        let mut readers = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        readers.spawn(read_records(
                            stream,
                            peer,
                            sink.clone(),
                            self.stats.clone(),
                            cancel.clone(),
                        ));
                    }
                    Err(e) => warn!("Failed to accept record stream: {}", e),
                },
                Some(_) = readers.join_next(), if !readers.is_empty() => {}
            }
        }

        while readers.join_next().await.is_some() {}
        Ok(())
    }
}

async fn read_records(
    stream: TcpStream,
    peer: SocketAddr,
    sink: mpsc::Sender<ConnectionRecord>,
    stats: Arc<CorrelatorStats>,
    cancel: CancellationToken,
) {
    debug!("Record stream from {} opened", peer);
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next() => line,
        };

        match line {
            Some(Ok(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ConnectionRecord>(line) {
                    Ok(record) => {
                        if sink.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        stats.record_rejected(RecordRejection::Undecodable);
                        debug!("Undecodable record from {}: {}", peer, e);
                    }
                }
            }
            Some(Err(e)) => {
                // The codec cannot resync after an oversized line
                stats.record_rejected(RecordRejection::Undecodable);
                warn!("Dropping record stream from {}: {}", peer, e);
                break;
            }
            None => break,
        }
    }

    debug!("Record stream from {} closed", peer);
}
