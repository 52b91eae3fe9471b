//! Connection records as they arrive and the graph edges they fold into

use crate::k8s::types::Workload;
use moss_common::{role, ConnectionIdentifier, ConnectionThroughputStats, ConnectionTuple};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One refresh from the capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub identifier: ConnectionIdentifier,
    pub stats: ConnectionThroughputStats,
}

/// Which side of the flow the observing process is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionRole {
    Unknown,
    Client,
    Server,
}

impl ConnectionRole {
    /// `None` for values the capture source never writes
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            role::UNKNOWN => Some(ConnectionRole::Unknown),
            role::CLIENT => Some(ConnectionRole::Client),
            role::SERVER => Some(ConnectionRole::Server),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Unknown => "unknown",
            ConnectionRole::Client => "client",
            ConnectionRole::Server => "server",
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of one connection across refreshes. The role is left out
/// because it may be refined between refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub id: u32,
    pub pid: u32,
    pub tuple: ConnectionTuple,
}

impl From<&ConnectionIdentifier> for ConnectionKey {
    fn from(identifier: &ConnectionIdentifier) -> Self {
        Self {
            id: identifier.id,
            pid: identifier.pid,
            tuple: identifier.tuple,
        }
    }
}

/// A deduplicated graph edge: client -> server:port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkLink {
    pub client: Workload,
    pub server: Workload,
    pub server_port: u16,
    pub role: ConnectionRole,
}

impl NetworkLink {
    pub fn key(&self) -> LinkKey {
        LinkKey {
            client: self.client.clone(),
            server: self.server.clone(),
            server_port: self.server_port,
        }
    }
}

/// Identity of an edge. The role is an attribute of the edge, so records of
/// one flow with and without a known role still collapse together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey {
    pub client: Workload,
    pub server: Workload,
    pub server_port: u16,
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}:{}", self.client, self.server, self.server_port)
    }
}

impl fmt::Display for NetworkLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}:{} ({})",
            self.client, self.server, self.server_port, self.role
        )
    }
}

/// Lifetime counters of one connection, from the client's side of the flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Throughput {
    /// client -> server
    pub bytes_sent: u64,
    /// server -> client
    pub bytes_received: u64,
    pub active: bool,
}

/// A connection resolved to workload granularity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub connection: ConnectionKey,
    pub link: NetworkLink,
    pub throughput: Throughput,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_raw() {
        assert_eq!(ConnectionRole::from_raw(0), Some(ConnectionRole::Unknown));
        assert_eq!(ConnectionRole::from_raw(1), Some(ConnectionRole::Client));
        assert_eq!(ConnectionRole::from_raw(2), Some(ConnectionRole::Server));
        assert_eq!(ConnectionRole::from_raw(7), None);
    }

    #[test]
    fn test_record_decodes_from_json() {
        let record: ConnectionRecord = serde_json::from_str(
            r#"{"identifier":{"id":3,"pid":99,"role":1,
                "tuple":{"src_ip":16777226,"dst_ip":33554442,"src_port":41000,"dst_port":8080}},
               "stats":{"bytes_sent":10,"bytes_received":20,"is_active":1}}"#,
        )
        .unwrap();

        assert_eq!(record.identifier.tuple.src().to_string(), "10.0.0.1");
        assert_eq!(record.identifier.tuple.dst().to_string(), "10.0.0.2");
        assert!(record.stats.active());
    }
}
