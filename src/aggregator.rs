//! Graph aggregator
//!
//! Folds resolved observations into deduplicated [`NetworkLink`] edges keyed
//! by (client, server, server port). The role is carried on the edge and only
//! ever refined from `Unknown`, never downgraded.
//!
//! The capture source reports lifetime totals, not deltas. Each connection's
//! last seen totals are kept so only the growth since the previous refresh is
//! added to its edge. A total that goes down means the counter restarted; the
//! new value becomes the baseline and nothing is added for that refresh.
//!
//! When a connection re-resolves onto another edge, its old contribution is
//! detached rather than moved: the old edge stays in the graph, inactive,
//! until the sweep finds the detached contribution idle.
//!
//! A connection entry is always locked before any edge or tombstone.

use crate::model::{ConnectionKey, ConnectionRole, LinkKey, NetworkLink, Observation};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct ConnectionState {
    link: LinkKey,
    last_sent: u64,
    last_received: u64,
    active: bool,
    refreshed: Instant,
}

/// Last totals of an evicted connection, kept for one idle timeout so late or
/// duplicate refreshes do not count it again
struct Tombstone {
    last_sent: u64,
    last_received: u64,
    retired: Instant,
}

struct Contribution {
    active: bool,
    refreshed: Instant,
    /// The connection has since moved to another edge
    detached: bool,
}

struct LinkState {
    role: ConnectionRole,
    bytes_sent: u64,
    bytes_received: u64,
    contributors: HashMap<ConnectionKey, Contribution>,
}

impl LinkState {
    fn new(role: ConnectionRole) -> Self {
        Self {
            role,
            bytes_sent: 0,
            bytes_received: 0,
            contributors: HashMap::new(),
        }
    }
}

/// Point-in-time view of one edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub link: NetworkLink,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active: bool,
    pub connections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// A refresh of an already evicted connection repeating its last totals
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub evicted: usize,
    pub links_removed: usize,
    pub tombstones_expired: usize,
}

#[derive(Default)]
struct AggregatorStats {
    upserts: AtomicU64,
    counter_resets: AtomicU64,
    evictions: AtomicU64,
    duplicates: AtomicU64,
}

/// Edge map shared by the correlator workers, the sweeper and the exporter
#[derive(Clone)]
pub struct GraphAggregator {
    links: Arc<DashMap<LinkKey, LinkState>>,
    connections: Arc<DashMap<ConnectionKey, ConnectionState>>,
    tombstones: Arc<DashMap<ConnectionKey, Tombstone>>,
    stats: Arc<AggregatorStats>,
    idle_timeout: Duration,
}

/// Growth of a lifetime counter since the last refresh, and whether it reset
fn counter_delta(last: u64, current: u64) -> (u64, bool) {
    if current >= last {
        (current - last, false)
    } else {
        (0, true)
    }
}

impl GraphAggregator {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            links: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            tombstones: Arc::new(DashMap::new()),
            stats: Arc::new(AggregatorStats::default()),
            idle_timeout,
        }
    }

    pub fn upsert(&self, observation: Observation) -> UpsertOutcome {
        self.upsert_at(observation, Instant::now())
    }

    pub fn upsert_at(&self, observation: Observation, now: Instant) -> UpsertOutcome {
        self.stats.upserts.fetch_add(1, Ordering::Relaxed);

        let Observation {
            connection,
            link,
            throughput,
        } = observation;
        let role = link.role;
        let link_key = link.key();

        // The connection entry stays locked until the edge is updated, which
        // makes the delta computation atomic per connection
        let (mut conn, outcome) = match self.connections.entry(connection) {
            Entry::Occupied(entry) => (entry.into_ref(), UpsertOutcome::Updated),
            Entry::Vacant(entry) => {
                let retired = self
                    .tombstones
                    .get(&connection)
                    .map(|t| (t.last_sent, t.last_received));

                // Lower totals than the tombstone mean the key was reused or
                // the counter restarted, and rebaseline like any other reset
                let (last_sent, last_received) = match retired {
                    Some((sent, received))
                        if throughput.bytes_sent == sent
                            && throughput.bytes_received == received =>
                    {
                        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                        return UpsertOutcome::Duplicate;
                    }
                    Some(baseline) => {
                        self.tombstones.remove(&connection);
                        baseline
                    }
                    None => (0, 0),
                };

                let state = ConnectionState {
                    link: link_key.clone(),
                    last_sent,
                    last_received,
                    active: throughput.active,
                    refreshed: now,
                };
                (entry.insert(state), UpsertOutcome::Created)
            }
        };

        let (sent, sent_reset) = counter_delta(conn.last_sent, throughput.bytes_sent);
        let (received, received_reset) =
            counter_delta(conn.last_received, throughput.bytes_received);

        if sent_reset || received_reset {
            self.stats.counter_resets.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Counter reset on connection {} pid {} ({}), rebaselining",
                connection.id, connection.pid, link
            );
        }

        conn.last_sent = throughput.bytes_sent;
        conn.last_received = throughput.bytes_received;
        conn.active = throughput.active;
        conn.refreshed = now;

        if conn.link != link_key {
            // Re-resolved endpoint; the old edge keeps a detached contribution
            // that the sweep evicts once idle
            if let Some(mut stale) = self.links.get_mut(&conn.link) {
                if let Some(contribution) = stale.contributors.get_mut(&connection) {
                    contribution.active = false;
                    contribution.detached = true;
                }
            }
            conn.link = link_key.clone();
        }

        let mut edge = self
            .links
            .entry(link_key)
            .or_insert_with(|| LinkState::new(role));
        if edge.role == ConnectionRole::Unknown {
            edge.role = role;
        }
        edge.bytes_sent = edge.bytes_sent.saturating_add(sent);
        edge.bytes_received = edge.bytes_received.saturating_add(received);
        edge.contributors.insert(
            connection,
            Contribution {
                active: throughput.active,
                refreshed: now,
                detached: false,
            },
        );

        outcome
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Evict contributions from inactive or idle connections and idle
    /// detached contributions, then drop edges left without contributors.
    /// Safe to run repeatedly: an evicted connection is gone and cannot be
    /// evicted twice.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let idle = |since: Instant| now.saturating_duration_since(since) >= self.idle_timeout;

        self.connections.retain(|key, conn| {
            if conn.active && !idle(conn.refreshed) {
                return true;
            }

            if let Some(mut edge) = self.links.get_mut(&conn.link) {
                edge.contributors.remove(key);
            }
            self.tombstones.insert(
                *key,
                Tombstone {
                    last_sent: conn.last_sent,
                    last_received: conn.last_received,
                    retired: now,
                },
            );
            report.evicted += 1;
            false
        });

        self.links.retain(|link, edge| {
            edge.contributors.retain(|_, c| !(c.detached && idle(c.refreshed)));
            if edge.contributors.is_empty() {
                debug!("Removing link {}", link);
                report.links_removed += 1;
                false
            } else {
                true
            }
        });

        self.tombstones.retain(|_, tombstone| {
            let keep = now.saturating_duration_since(tombstone.retired) < self.idle_timeout;
            if !keep {
                report.tombstones_expired += 1;
            }
            keep
        });

        self.stats
            .evictions
            .fetch_add(report.evicted as u64, Ordering::Relaxed);

        report
    }

    /// Periodic eviction, off the ingestion path
    pub async fn run_sweeper(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep();
                    if report != SweepReport::default() {
                        debug!(
                            "Sweep: {} contributions evicted, {} links removed, {} tombstones expired",
                            report.evicted, report.links_removed, report.tombstones_expired
                        );
                    }
                }
            }
        }
    }

    /// Ordered copy of every edge that still has contributors.
    ///
    /// Consistency is per edge: each edge is copied whole under its shard's
    /// read lock, so its counters, role and contributors always agree. Shards
    /// are locked one after another, so two edges may be copied on either
    /// side of a concurrent upsert.
    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        let mut links: Vec<LinkSnapshot> = self
            .links
            .iter()
            .filter(|entry| !entry.value().contributors.is_empty())
            .map(|entry| {
                let edge = entry.value();
                let key = entry.key();
                LinkSnapshot {
                    link: NetworkLink {
                        client: key.client.clone(),
                        server: key.server.clone(),
                        server_port: key.server_port,
                        role: edge.role,
                    },
                    bytes_sent: edge.bytes_sent,
                    bytes_received: edge.bytes_received,
                    active: edge.contributors.values().any(|c| c.active),
                    connections: edge
                        .contributors
                        .values()
                        .filter(|c| !c.detached)
                        .count(),
                }
            })
            .collect();

        links.sort_by(|a, b| a.link.cmp(&b.link));
        links
    }

    /// Get the number of live edges
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Get the number of tracked connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn upserts(&self) -> u64 {
        self.stats.upserts.load(Ordering::Relaxed)
    }

    pub fn counter_resets(&self) -> u64 {
        self.stats.counter_resets.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.stats.evictions.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.stats.duplicates.load(Ordering::Relaxed)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}
