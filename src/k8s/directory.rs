//! IP -> workload directory
//!
//! Readers share a [`WorkloadDirectory`] handle and only ever touch the
//! published index, a sharded concurrent map. All mutation goes through the
//! single [`DirectoryWriter`], which owns the per-resource bookkeeping and
//! consumes watch events from one ordered channel.

use crate::k8s::types::{
    IpOwnership, Precedence, ResourceKey, ResourceKind, ResourceState, Workload, WorkloadEvent,
};
use dashmap::DashMap;
use ipnet::Ipv4Net;
use moss_common::Ip;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Directory lifecycle. `Ready` once every resource kind finished its first
/// full list; drops back to `Syncing` while a kind relists after a broken
/// watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Unstarted,
    Syncing,
    Ready,
}

impl Readiness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Readiness::Unstarted => "unstarted",
            Readiness::Syncing => "syncing",
            Readiness::Ready => "ready",
        }
    }
}

/// Outcome of a direct lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(Workload),
    /// No owner, and the directory is fully synced
    Miss,
    /// No owner yet, but the directory has not finished populating
    NotReady,
}

struct Shared {
    index: DashMap<Ip, Workload>,
    dns_index: DashMap<Ip, Workload>,
    external_names: DashMap<ResourceKey, String>,
    cluster_cidrs: Vec<Ipv4Net>,
    readiness: watch::Sender<Readiness>,
    lookups_before_ready: AtomicU64,
}

/// Read handle, cheap to clone
#[derive(Clone)]
pub struct WorkloadDirectory {
    shared: Arc<Shared>,
}

impl WorkloadDirectory {
    /// Create an empty directory and the one writer allowed to mutate it
    pub fn new(cluster_cidrs: Vec<Ipv4Net>) -> (Self, DirectoryWriter) {
        let (readiness, _) = watch::channel(Readiness::Unstarted);
        let shared = Arc::new(Shared {
            index: DashMap::new(),
            dns_index: DashMap::new(),
            external_names: DashMap::new(),
            cluster_cidrs,
            readiness,
            lookups_before_ready: AtomicU64::new(0),
        });

        let writer = DirectoryWriter {
            shared: shared.clone(),
            resources: HashMap::new(),
            claims: HashMap::new(),
            endpoint_targets: HashMap::new(),
            relisting: HashMap::new(),
            synced: HashSet::new(),
            started: false,
            generation: 0,
        };

        (Self { shared }, writer)
    }

    /// Direct lookup against the published index. Never blocks on the writer.
    pub fn lookup(&self, ip: Ip) -> Lookup {
        if let Some(workload) = self.shared.index.get(&ip) {
            return Lookup::Hit(workload.clone());
        }

        if self.readiness() == Readiness::Ready {
            Lookup::Miss
        } else {
            self.shared
                .lookups_before_ready
                .fetch_add(1, Ordering::Relaxed);
            Lookup::NotReady
        }
    }

    /// Full classification: direct match, then the DNS index, then
    /// `Unknown` for cluster ranges and `External` for everything else.
    pub fn resolve(&self, ip: Ip) -> Workload {
        if let Lookup::Hit(workload) = self.lookup(ip) {
            return workload;
        }

        if let Some(workload) = self.shared.dns_index.get(&ip) {
            return workload.clone();
        }

        self.classify_unresolved(ip)
    }

    pub fn classify_unresolved(&self, ip: Ip) -> Workload {
        if self.is_cluster_address(ip) {
            Workload::Unknown { ip }
        } else {
            Workload::External { ip }
        }
    }

    pub fn is_cluster_address(&self, ip: Ip) -> bool {
        let addr = ip.to_ipv4();
        self.shared
            .cluster_cidrs
            .iter()
            .any(|net| net.contains(&addr))
    }

    pub fn readiness(&self) -> Readiness {
        *self.shared.readiness.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    /// Resolves once the directory reaches `Ready`
    pub async fn wait_ready(&self) {
        let mut rx = self.shared.readiness.subscribe();
        // The sender lives in `Shared`, which we hold, so this cannot fail
        let _ = rx.wait_for(|r| *r == Readiness::Ready).await;
    }

    /// Number of addresses with a current owner
    pub fn len(&self) -> usize {
        self.shared.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.index.is_empty()
    }

    pub fn dns_entries(&self) -> usize {
        self.shared.dns_index.len()
    }

    pub fn lookups_before_ready(&self) -> u64 {
        self.shared.lookups_before_ready.load(Ordering::Relaxed)
    }

    /// All published mappings (for debugging/metrics)
    pub fn entries(&self) -> Vec<(Ip, Workload)> {
        self.shared
            .index
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect()
    }

    /// `ExternalName` services and their host names
    pub fn external_names(&self) -> Vec<(ResourceKey, String)> {
        self.shared
            .external_names
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    /// Replace the DNS-derived index with a freshly resolved one
    pub(crate) fn publish_dns(&self, resolved: HashMap<Ip, Workload>) {
        self.shared
            .dns_index
            .retain(|ip, _| resolved.contains_key(ip));
        for (ip, workload) in resolved {
            self.shared.dns_index.insert(ip, workload);
        }
    }
}

#[derive(Debug, Clone)]
struct Claim {
    owner: ResourceKey,
    workload: Workload,
    precedence: Precedence,
    generation: u64,
}

/// Sole mutator of the directory
pub struct DirectoryWriter {
    shared: Arc<Shared>,
    resources: HashMap<ResourceKey, Vec<IpOwnership>>,
    claims: HashMap<Ip, Vec<Claim>>,
    /// Addresses that endpoint claims attribute to each pod
    endpoint_targets: HashMap<ResourceKey, HashSet<Ip>>,
    relisting: HashMap<ResourceKind, HashSet<ResourceKey>>,
    synced: HashSet<ResourceKind>,
    started: bool,
    generation: u64,
}

impl DirectoryWriter {
    /// Apply events until the channel closes or `cancel` fires. Each event is
    /// applied to completion before the next is taken.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<WorkloadEvent>,
        cancel: CancellationToken,
    ) {
        info!("Directory writer started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Directory writer cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => {
                        debug!("Directory event channel closed");
                        break;
                    }
                },
            }
        }

        info!(
            "Directory writer stopped. Tracking {} resources, {} addresses",
            self.resources.len(),
            self.shared.index.len()
        );
    }

    pub fn apply(&mut self, event: WorkloadEvent) {
        match event {
            WorkloadEvent::Applied(state) => self.upsert(state),
            WorkloadEvent::Deleted(key) => {
                if let Some(seen) = self.relisting.get_mut(&key.kind) {
                    seen.remove(&key);
                }
                self.remove(&key);
            }
            WorkloadEvent::RelistStarted(kind) => self.relist_started(kind),
            WorkloadEvent::RelistCompleted(kind) => self.relist_completed(kind),
            WorkloadEvent::WatchLost(kind) => {
                if self.synced.remove(&kind) {
                    warn!("{} watch lost, directory state may be stale", kind);
                }
                self.relisting.remove(&kind);
                self.update_readiness();
            }
        }
    }

    fn upsert(&mut self, state: ResourceState) {
        self.generation += 1;
        let generation = self.generation;
        let key = state.key;

        if let Some(seen) = self.relisting.get_mut(&key.kind) {
            seen.insert(key.clone());
        }

        match state.external_name {
            Some(host) => {
                self.shared.external_names.insert(key.clone(), host);
            }
            None => {
                self.shared.external_names.remove(&key);
            }
        }

        let previous = self
            .resources
            .insert(key.clone(), state.claims.clone())
            .unwrap_or_default();

        let mut touched = HashSet::new();

        // Unchanged claims keep their generation, so a resync never reorders
        // which of two competing owners wins
        for old in previous.iter().filter(|o| !state.claims.contains(o)) {
            self.drop_claim(old.ip, &key);
            touched.insert(old.ip);
        }
        for new in state.claims.iter().filter(|c| !previous.contains(c)) {
            self.add_claim(new, &key, generation);
            touched.insert(new.ip);
        }
        if let Some(targeted) = self.endpoint_targets.get(&key) {
            touched.extend(targeted.iter().copied());
        }

        for ip in touched {
            self.publish(ip);
        }

        debug!("Applied {} ({} addresses)", key, state.claims.len());
    }

    fn remove(&mut self, key: &ResourceKey) {
        self.shared.external_names.remove(key);

        let Some(owned) = self.resources.remove(key) else {
            return;
        };

        for claim in &owned {
            self.drop_claim(claim.ip, key);
        }

        // Endpoint claims naming a deleted pod stop resolving with it
        let mut touched: HashSet<Ip> = owned.iter().map(|c| c.ip).collect();
        if let Some(targeted) = self.endpoint_targets.get(key) {
            touched.extend(targeted.iter().copied());
        }
        for ip in touched {
            self.publish(ip);
        }

        debug!("Removed {} ({} addresses)", key, owned.len());
    }

    fn relist_started(&mut self, kind: ResourceKind) {
        debug!("{} relist started", kind);
        self.started = true;
        self.relisting.insert(kind, HashSet::new());
        self.update_readiness();
    }

    fn relist_completed(&mut self, kind: ResourceKind) {
        let seen = self.relisting.remove(&kind).unwrap_or_default();

        let stale: Vec<ResourceKey> = self
            .resources
            .keys()
            .filter(|k| k.kind == kind && !seen.contains(*k))
            .cloned()
            .collect();

        for key in &stale {
            self.remove(key);
        }

        self.synced.insert(kind);
        self.started = true;

        info!(
            "{} relist complete: {} listed, {} stale removed. Tracking {} addresses",
            kind,
            seen.len(),
            stale.len(),
            self.shared.index.len()
        );

        self.update_readiness();
    }

    fn add_claim(&mut self, ownership: &IpOwnership, owner: &ResourceKey, generation: u64) {
        self.drop_claim(ownership.ip, owner);

        if let Some(pod) = endpoint_target(ownership.precedence, &ownership.workload) {
            self.endpoint_targets
                .entry(pod)
                .or_default()
                .insert(ownership.ip);
        }

        self.claims.entry(ownership.ip).or_default().push(Claim {
            owner: owner.clone(),
            workload: ownership.workload.clone(),
            precedence: ownership.precedence,
            generation,
        });
    }

    fn drop_claim(&mut self, ip: Ip, owner: &ResourceKey) {
        let Some(claims) = self.claims.get_mut(&ip) else {
            return;
        };

        let mut dropped = Vec::new();
        claims.retain(|c| {
            if &c.owner == owner {
                dropped.extend(endpoint_target(c.precedence, &c.workload));
                false
            } else {
                true
            }
        });
        if claims.is_empty() {
            self.claims.remove(&ip);
        }

        // Another endpoint claim may still attribute this address to the pod
        for pod in dropped {
            let still_targeted = self.claims.get(&ip).is_some_and(|claims| {
                claims.iter().any(|c| {
                    endpoint_target(c.precedence, &c.workload).is_some_and(|p| p == pod)
                })
            });
            if still_targeted {
                continue;
            }
            if let Some(targeted) = self.endpoint_targets.get_mut(&pod) {
                targeted.remove(&ip);
                if targeted.is_empty() {
                    self.endpoint_targets.remove(&pod);
                }
            }
        }
    }

    /// An endpoint claim naming a pod only counts while that pod is live
    fn is_live(&self, claim: &Claim) -> bool {
        match endpoint_target(claim.precedence, &claim.workload) {
            Some(pod) => self.resources.contains_key(&pod),
            None => true,
        }
    }

    /// Recompute the winning claim for `ip` and publish it to readers
    fn publish(&self, ip: Ip) {
        let winner = self.claims.get(&ip).and_then(|claims| {
            claims
                .iter()
                .filter(|c| self.is_live(c))
                .max_by_key(|c| (c.precedence, c.generation))
        });

        match winner {
            Some(claim) => {
                self.shared.index.insert(ip, claim.workload.clone());
            }
            None => {
                self.shared.index.remove(&ip);
            }
        }
    }

    fn update_readiness(&self) {
        let next = if ResourceKind::ALL.iter().all(|k| self.synced.contains(k)) {
            Readiness::Ready
        } else if self.started {
            Readiness::Syncing
        } else {
            Readiness::Unstarted
        };

        self.shared.readiness.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!("Directory {} -> {}", current.as_str(), next.as_str());
            *current = next;
            true
        });
    }
}

/// The pod an endpoint claim attributes its address to, if any
fn endpoint_target(precedence: Precedence, workload: &Workload) -> Option<ResourceKey> {
    match (precedence, workload) {
        (Precedence::EndpointAddress, Workload::Pod { namespace, name }) => Some(
            ResourceKey::new(ResourceKind::Pod, namespace.as_str(), name.as_str()),
        ),
        _ => None,
    }
}
