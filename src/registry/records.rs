//! Record types stored in the registry. The registry itself does not
//! interpret them; the reconcilers do.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// Name of the singleton [`ClusterNetwork`] record.
pub const CLUSTER_NETWORK_NAME: &str = "default";

pub trait Record: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn key(&self) -> String;
}

/// Cluster-wide network configuration, written by the master at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNetwork {
    pub name: String,
    pub network: Ipv4Network,
    pub host_subnet_bits: u32,
    pub service_network: Ipv4Network,
}

impl Record for ClusterNetwork {
    const KIND: &'static str = "ClusterNetwork";

    fn key(&self) -> String {
        self.name.clone()
    }
}

/// Maps a node to the pod-network subnet allocated to it. Written only by
/// the master; nodes are readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSubnet {
    pub name: String,
    pub host: String,
    pub host_ip: String,
    pub subnet: Ipv4Network,
}

impl Record for HostSubnet {
    const KIND: &'static str = "HostSubnet";

    fn key(&self) -> String {
        self.name.clone()
    }
}

/// Maps a tenant namespace to its VNID. Authoritative for the assignment;
/// the namespace annotations are only the admin/reconciler channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetNamespace {
    pub name: String,
    pub net_id: u32,
}

impl Record for NetNamespace {
    const KIND: &'static str = "NetNamespace";

    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl Record for Namespace {
    const KIND: &'static str = "Namespace";

    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Kept as delivered by the node object so validation can reject empty
    /// or malformed addresses.
    pub ip: String,
}

impl Node {
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
        }
    }
}

impl Record for Node {
    const KIND: &'static str = "Node";

    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub protocol: Protocol,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    /// `None` for headless services.
    pub cluster_ip: Option<Ipv4Addr>,
    pub ports: Vec<ServicePort>,
}

impl Service {
    pub fn is_ip_set(&self) -> bool {
        self.cluster_ip.is_some()
    }
}

impl Record for Service {
    const KIND: &'static str = "Service";

    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
    pub phase: PodPhase,
    pub ip: Option<Ipv4Addr>,
    pub container_id: String,
}

impl Record for Pod {
    const KIND: &'static str = "Pod";

    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Endpoint addresses published for a service, as handed to the endpoint
/// filter by the proxy layer. Not a stored record kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    pub name: String,
    pub namespace: String,
    pub addresses: Vec<Ipv4Addr>,
}
