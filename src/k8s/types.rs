//! Workload identities and the IP ownership each cluster resource claims

use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use moss_common::Ip;
use std::borrow::Cow;
use std::fmt;
use std::net::Ipv4Addr;

/// Semantic identity of a network endpoint.
///
/// Only the directory produces `Pod`/`Service` values. `Unknown` is an address
/// inside the cluster ranges without a current owner; `External` is anything
/// outside them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Workload {
    Pod { namespace: String, name: String },
    Service { namespace: String, name: String },
    Unknown { ip: Ip },
    External { ip: Ip },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    Pod,
    Service,
    Unknown,
    External,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Pod => "pod",
            WorkloadKind::Service => "service",
            WorkloadKind::Unknown => "unknown",
            WorkloadKind::External => "external",
        }
    }
}

impl Workload {
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Workload::Pod {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn service(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Workload::Service {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Pod { .. } => WorkloadKind::Pod,
            Workload::Service { .. } => WorkloadKind::Service,
            Workload::Unknown { .. } => WorkloadKind::Unknown,
            Workload::External { .. } => WorkloadKind::External,
        }
    }

    /// Empty for endpoints without a Kubernetes identity
    pub fn namespace(&self) -> &str {
        match self {
            Workload::Pod { namespace, .. } | Workload::Service { namespace, .. } => namespace,
            Workload::Unknown { .. } | Workload::External { .. } => "",
        }
    }

    /// Object name, or the address itself when unresolved
    pub fn name(&self) -> Cow<'_, str> {
        match self {
            Workload::Pod { name, .. } | Workload::Service { name, .. } => Cow::Borrowed(name),
            Workload::Unknown { ip } | Workload::External { ip } => Cow::Owned(ip.to_string()),
        }
    }

    pub fn is_resolved(&self) -> bool {
        match self {
            Workload::Pod { .. } | Workload::Service { .. } => true,
            Workload::Unknown { .. } | Workload::External { .. } => false,
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workload::Pod { namespace, name } => write!(f, "pod/{}/{}", namespace, name),
            Workload::Service { namespace, name } => write!(f, "service/{}/{}", namespace, name),
            Workload::Unknown { ip } => write!(f, "unknown/{}", ip),
            Workload::External { ip } => write!(f, "external/{}", ip),
        }
    }
}

/// Cluster resource types the directory is fed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Pod,
    Service,
    Endpoints,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Pod,
        ResourceKind::Service,
        ResourceKind::Endpoints,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::Service => "Service",
            ResourceKind::Endpoints => "Endpoints",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// How strongly a claim binds an address. When several resources claim the
/// same IP the highest precedence wins, then the most recently applied one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Precedence {
    EndpointAddress,
    PodIp,
    ServiceIp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpOwnership {
    pub ip: Ip,
    pub workload: Workload,
    pub precedence: Precedence,
}

/// Everything one resource currently says about address ownership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceState {
    pub key: ResourceKey,
    pub claims: Vec<IpOwnership>,
    /// Host name of an `ExternalName` service, for DNS-assisted resolution
    pub external_name: Option<String>,
}

impl ResourceState {
    /// Keeps one claim per address, the strongest.
    pub fn new(key: ResourceKey, mut claims: Vec<IpOwnership>) -> Self {
        claims.sort_by(|a, b| a.ip.cmp(&b.ip).then(b.precedence.cmp(&a.precedence)));
        claims.dedup_by_key(|c| c.ip);
        Self {
            key,
            claims,
            external_name: None,
        }
    }
}

/// One change to apply to the directory, in watch order.
#[derive(Debug, Clone)]
pub enum WorkloadEvent {
    /// Added or Modified; carries the full current state of the resource
    Applied(ResourceState),
    Deleted(ResourceKey),
    /// A full list of `kind` begins; the `Applied` events that follow form the
    /// resync set
    RelistStarted(ResourceKind),
    /// The resync set is complete; anything of `kind` not in it is gone
    RelistCompleted(ResourceKind),
    /// The watch for `kind` broke; state is stale until the next relist
    WatchLost(ResourceKind),
}

/// A Kubernetes object that can claim addresses in the directory
pub trait ClusterResource {
    const RESOURCE_KIND: ResourceKind;

    fn resource_key(&self) -> Option<ResourceKey>;

    /// `None` when the object lacks the identity needed to track it
    fn ownership(&self) -> Option<ResourceState>;
}

fn key_from_meta(kind: ResourceKind, meta: &ObjectMeta) -> Option<ResourceKey> {
    let name = meta.name.as_deref().filter(|n| !n.is_empty())?;
    let namespace = meta.namespace.as_deref().unwrap_or("default");
    Some(ResourceKey::new(kind, namespace, name))
}

/// IPv4 only; the capture source reports 32-bit addresses
pub fn parse_ipv4(raw: &str) -> Option<Ip> {
    raw.trim().parse::<Ipv4Addr>().ok().map(Ip::from)
}

impl ClusterResource for Pod {
    const RESOURCE_KIND: ResourceKind = ResourceKind::Pod;

    fn resource_key(&self) -> Option<ResourceKey> {
        key_from_meta(Self::RESOURCE_KIND, &self.metadata)
    }

    fn ownership(&self) -> Option<ResourceState> {
        let key = self.resource_key()?;

        // Host-network pods share the node address with everything else on it
        let host_network = self
            .spec
            .as_ref()
            .and_then(|s| s.host_network)
            .unwrap_or(false);

        let status = self.status.as_ref();

        // Finished pods release their address for reuse
        let finished = matches!(
            status.and_then(|s| s.phase.as_deref()),
            Some("Succeeded") | Some("Failed")
        );

        let mut claims = Vec::new();
        if !host_network && !finished {
            if let Some(ip) = status.and_then(|s| s.pod_ip.as_deref()).and_then(parse_ipv4) {
                claims.push(IpOwnership {
                    ip,
                    workload: Workload::pod(&key.namespace, &key.name),
                    precedence: Precedence::PodIp,
                });
            }
        }

        Some(ResourceState::new(key, claims))
    }
}

impl ClusterResource for Service {
    const RESOURCE_KIND: ResourceKind = ResourceKind::Service;

    fn resource_key(&self) -> Option<ResourceKey> {
        key_from_meta(Self::RESOURCE_KIND, &self.metadata)
    }

    fn ownership(&self) -> Option<ResourceState> {
        let key = self.resource_key()?;
        let workload = Workload::service(&key.namespace, &key.name);
        let spec = self.spec.as_ref();

        let mut raw_ips: Vec<&str> = Vec::new();
        if let Some(spec) = spec {
            raw_ips.extend(spec.cluster_ip.as_deref());
            raw_ips.extend(spec.cluster_ips.iter().flatten().map(String::as_str));
        }

        let ingress = self
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref());
        raw_ips.extend(ingress.into_iter().flatten().filter_map(|i| i.ip.as_deref()));

        let claims = raw_ips
            .into_iter()
            .filter(|raw| !raw.is_empty() && *raw != "None")
            .filter_map(parse_ipv4)
            .map(|ip| IpOwnership {
                ip,
                workload: workload.clone(),
                precedence: Precedence::ServiceIp,
            })
            .collect();

        let mut state = ResourceState::new(key, claims);
        state.external_name = spec
            .filter(|s| s.type_.as_deref() == Some("ExternalName"))
            .and_then(|s| s.external_name.clone())
            .filter(|name| !name.is_empty());

        Some(state)
    }
}

impl ClusterResource for Endpoints {
    const RESOURCE_KIND: ResourceKind = ResourceKind::Endpoints;

    fn resource_key(&self) -> Option<ResourceKey> {
        key_from_meta(Self::RESOURCE_KIND, &self.metadata)
    }

    fn ownership(&self) -> Option<ResourceState> {
        let key = self.resource_key()?;
        let mut claims = Vec::new();

        for subset in self.subsets.iter().flatten() {
            let addresses = subset
                .addresses
                .iter()
                .flatten()
                .chain(subset.not_ready_addresses.iter().flatten());

            for address in addresses {
                let Some(ip) = parse_ipv4(&address.ip) else {
                    continue;
                };

                // Backing pods are named by targetRef; anything else (manually
                // managed endpoints) belongs to the service itself
                let workload = match address.target_ref.as_ref() {
                    Some(target) if target.kind.as_deref() == Some("Pod") => {
                        match target.name.as_deref() {
                            Some(name) => Workload::pod(
                                target.namespace.as_deref().unwrap_or(&key.namespace),
                                name,
                            ),
                            None => continue,
                        }
                    }
                    _ => Workload::service(&key.namespace, &key.name),
                };

                claims.push(IpOwnership {
                    ip,
                    workload,
                    precedence: Precedence::EndpointAddress,
                });
            }
        }

        Some(ResourceState::new(key, claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointSubset, LoadBalancerIngress, LoadBalancerStatus, ObjectReference,
        PodSpec, PodStatus, ServiceSpec, ServiceStatus,
    };

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn pod(name: &str, ip: &str, phase: &str) -> Pod {
        Pod {
            metadata: meta("default", name),
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                pod_ip: Some(ip.to_string()),
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_running_pod_claims_its_ip() {
        let state = pod("nginx", "10.244.0.5", "Running").ownership().unwrap();

        assert_eq!(state.key, ResourceKey::new(ResourceKind::Pod, "default", "nginx"));
        assert_eq!(state.claims.len(), 1);
        assert_eq!(state.claims[0].ip.to_string(), "10.244.0.5");
        assert_eq!(state.claims[0].workload, Workload::pod("default", "nginx"));
        assert_eq!(state.claims[0].precedence, Precedence::PodIp);
    }

    #[test]
    fn test_finished_pod_releases_ip() {
        let state = pod("job", "10.244.0.6", "Succeeded").ownership().unwrap();
        assert!(state.claims.is_empty());
    }

    #[test]
    fn test_host_network_pod_claims_nothing() {
        let mut p = pod("kube-proxy", "192.168.1.10", "Running");
        p.spec = Some(PodSpec {
            host_network: Some(true),
            ..Default::default()
        });
        assert!(p.ownership().unwrap().claims.is_empty());
    }

    #[test]
    fn test_pod_without_name_is_skipped() {
        let mut p = pod("x", "10.0.0.1", "Running");
        p.metadata.name = None;
        assert!(p.ownership().is_none());
    }

    #[test]
    fn test_service_cluster_and_ingress_ips() {
        let svc = Service {
            metadata: meta("shop", "web"),
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.10".to_string()),
                cluster_ips: Some(vec!["10.96.0.10".to_string()]),
                ..Default::default()
            }),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some("192.168.50.1".to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
        };

        let state = svc.ownership().unwrap();
        let ips: Vec<String> = state.claims.iter().map(|c| c.ip.to_string()).collect();
        assert_eq!(state.claims.len(), 2);
        assert!(ips.contains(&"10.96.0.10".to_string()));
        assert!(ips.contains(&"192.168.50.1".to_string()));
        assert!(state
            .claims
            .iter()
            .all(|c| c.workload == Workload::service("shop", "web")));
    }

    #[test]
    fn test_headless_service_claims_nothing() {
        let svc = Service {
            metadata: meta("shop", "db"),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                ..Default::default()
            }),
            status: None,
        };
        assert!(svc.ownership().unwrap().claims.is_empty());
    }

    #[test]
    fn test_external_name_service_is_recorded() {
        let svc = Service {
            metadata: meta("shop", "payments"),
            spec: Some(ServiceSpec {
                type_: Some("ExternalName".to_string()),
                external_name: Some("payments.example.com".to_string()),
                ..Default::default()
            }),
            status: None,
        };
        let state = svc.ownership().unwrap();
        assert_eq!(state.external_name.as_deref(), Some("payments.example.com"));
    }

    #[test]
    fn test_endpoints_attribute_to_target_pod() {
        let endpoints = Endpoints {
            metadata: meta("shop", "web"),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![
                    EndpointAddress {
                        ip: "10.244.1.4".to_string(),
                        target_ref: Some(ObjectReference {
                            kind: Some("Pod".to_string()),
                            name: Some("web-7d9f".to_string()),
                            namespace: Some("shop".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    EndpointAddress {
                        ip: "172.20.0.9".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }]),
        };

        let state = endpoints.ownership().unwrap();
        assert_eq!(state.claims.len(), 2);

        let by_ip = |ip: &str| {
            state
                .claims
                .iter()
                .find(|c| c.ip.to_string() == ip)
                .map(|c| c.workload.clone())
        };
        assert_eq!(by_ip("10.244.1.4"), Some(Workload::pod("shop", "web-7d9f")));
        assert_eq!(by_ip("172.20.0.9"), Some(Workload::service("shop", "web")));
        assert!(state
            .claims
            .iter()
            .all(|c| c.precedence == Precedence::EndpointAddress));
    }

    #[test]
    fn test_resource_state_keeps_strongest_claim_per_ip() {
        let ip = parse_ipv4("10.0.0.1").unwrap();
        let state = ResourceState::new(
            ResourceKey::new(ResourceKind::Service, "a", "b"),
            vec![
                IpOwnership {
                    ip,
                    workload: Workload::service("a", "b"),
                    precedence: Precedence::EndpointAddress,
                },
                IpOwnership {
                    ip,
                    workload: Workload::service("a", "b"),
                    precedence: Precedence::ServiceIp,
                },
            ],
        );
        assert_eq!(state.claims.len(), 1);
        assert_eq!(state.claims[0].precedence, Precedence::ServiceIp);
    }

    #[test]
    fn test_unresolved_workload_labels() {
        let ip = parse_ipv4("8.8.8.8").unwrap();
        let w = Workload::External { ip };
        assert_eq!(w.kind().as_str(), "external");
        assert_eq!(w.namespace(), "");
        assert_eq!(w.name(), "8.8.8.8");
        assert!(!w.is_resolved());
        assert_eq!(w.to_string(), "external/8.8.8.8");
    }
}
