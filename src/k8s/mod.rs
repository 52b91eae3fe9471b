pub mod client;
pub mod directory;
pub mod dns;
pub mod types;
pub mod watcher;

pub use client::K8sClient;
pub use directory::{DirectoryWriter, Lookup, Readiness, WorkloadDirectory};
pub use dns::{DnsRefresher, HostResolver, SystemResolver};
pub use types::{ResourceKey, ResourceKind, Workload, WorkloadEvent, WorkloadKind};
pub use watcher::ClusterWatcher;
