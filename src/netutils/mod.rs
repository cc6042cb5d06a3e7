//! Network math shared by the master reconcilers and the node view.

mod subnet_allocator;
mod vnid_allocator;

pub use subnet_allocator::SubnetAllocator;
pub use vnid_allocator::VnidAllocator;

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::registry::ClusterNetwork;
use crate::{Error, Result};

/// Validated cluster network parameters: the pod-network CIDR, the number of
/// bits appended to its prefix for each node subnet, and the service CIDR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkInfo {
    pub cluster_network: Ipv4Network,
    pub host_subnet_bits: u32,
    pub service_network: Ipv4Network,
}

impl NetworkInfo {
    /// Validates raw configuration parameters. A parse failure or an
    /// overlapping service network is unrecoverable and aborts startup.
    pub fn validate(cluster_cidr: &str, host_subnet_bits: u32, service_cidr: &str) -> Result<Self> {
        let cluster_network: Ipv4Network = cluster_cidr.parse().map_err(|e| {
            Error::InvalidNetworkConfig(format!("failed to parse cluster cidr {cluster_cidr:?}: {e}"))
        })?;
        let service_network: Ipv4Network = service_cidr.parse().map_err(|e| {
            Error::InvalidNetworkConfig(format!("failed to parse service cidr {service_cidr:?}: {e}"))
        })?;

        if host_subnet_bits == 0 {
            return Err(Error::InvalidNetworkConfig(
                "host subnet bits must be greater than zero".into(),
            ));
        }
        // Each node subnet must leave room for at least a /30 worth of pods.
        if u32::from(cluster_network.prefix()) + host_subnet_bits > 30 {
            return Err(Error::InvalidNetworkConfig(format!(
                "cluster network {cluster_network} cannot be split into /{} subnets",
                u32::from(cluster_network.prefix()) + host_subnet_bits
            )));
        }
        if networks_overlap(cluster_network, service_network) {
            return Err(Error::InvalidNetworkConfig(format!(
                "service network {service_network} overlaps cluster network {cluster_network}"
            )));
        }

        Ok(Self {
            cluster_network,
            host_subnet_bits,
            service_network,
        })
    }

    pub fn from_record(record: &ClusterNetwork) -> Self {
        Self {
            cluster_network: record.network,
            host_subnet_bits: record.host_subnet_bits,
            service_network: record.service_network,
        }
    }

    pub fn changed(&self, other: &NetworkInfo) -> bool {
        self != other
    }

    /// Prefix length of the per-node subnets carved from the cluster network.
    pub fn subnet_prefix(&self) -> u8 {
        self.cluster_network.prefix() + self.host_subnet_bits as u8
    }
}

pub fn networks_overlap(a: Ipv4Network, b: Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// Validates a node IP delivered by a node or host-subnet event. The address
/// must be non-empty, parseable, not a loopback address and not carved out of
/// the pod network.
pub fn validate_node_ip(ip: &str, cluster_network: &Ipv4Network) -> Result<Ipv4Addr> {
    if ip.is_empty() {
        return Err(Error::InvalidNodeIp("node ip is empty".into()));
    }
    let addr: Ipv4Addr = ip
        .parse()
        .map_err(|_| Error::InvalidNodeIp(format!("failed to parse node ip {ip:?}")))?;
    if addr.is_loopback() {
        return Err(Error::InvalidNodeIp(format!("node ip {addr} is a loopback address")));
    }
    if cluster_network.contains(addr) {
        return Err(Error::InvalidNodeIp(format!(
            "node ip {addr} is part of cluster network {cluster_network}"
        )));
    }
    Ok(addr)
}
