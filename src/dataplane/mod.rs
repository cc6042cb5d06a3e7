pub mod recording;

use ipnetwork::Ipv4Network;
use tracing::debug;

use crate::Result;
use crate::registry::{HostSubnet, Service};

/// Capability set the reconcilers invoke to program the dataplane. Hook
/// invocations are at-least-once; implementations must be idempotent.
pub trait Dataplane: Send + Sync {
    fn start_master(&self, cluster_network: Ipv4Network, host_subnet_bits: u32) -> Result<()>;

    fn start_node(&self, mtu: u32) -> Result<()>;

    /// Brings up the local pod network. Returns whether the dataplane had to
    /// be reconfigured.
    fn setup_sdn(
        &self,
        local_subnet: Ipv4Network,
        cluster_network: Ipv4Network,
        service_network: Ipv4Network,
        mtu: u32,
    ) -> Result<bool>;

    fn add_host_subnet_rules(&self, subnet: &HostSubnet) -> Result<()>;

    fn delete_host_subnet_rules(&self, subnet: &HostSubnet) -> Result<()>;

    fn add_service_rules(&self, service: &Service, vnid: u32) -> Result<()>;

    fn delete_service_rules(&self, service: &Service) -> Result<()>;

    fn update_pod(&self, namespace: &str, name: &str, container_id: &str) -> Result<()>;
}

/// Dataplane that only logs hook invocations, for running the control plane
/// without a programmable switch underneath.
pub struct NoopDataplane;

impl Dataplane for NoopDataplane {
    fn start_master(&self, cluster_network: Ipv4Network, host_subnet_bits: u32) -> Result<()> {
        debug!("start_master {cluster_network} /{host_subnet_bits}");
        Ok(())
    }

    fn start_node(&self, mtu: u32) -> Result<()> {
        debug!("start_node mtu {mtu}");
        Ok(())
    }

    fn setup_sdn(
        &self,
        local_subnet: Ipv4Network,
        cluster_network: Ipv4Network,
        service_network: Ipv4Network,
        mtu: u32,
    ) -> Result<bool> {
        debug!("setup_sdn {local_subnet} {cluster_network} {service_network} mtu {mtu}");
        Ok(true)
    }

    fn add_host_subnet_rules(&self, subnet: &HostSubnet) -> Result<()> {
        debug!("add_host_subnet_rules {} {}", subnet.host, subnet.subnet);
        Ok(())
    }

    fn delete_host_subnet_rules(&self, subnet: &HostSubnet) -> Result<()> {
        debug!("delete_host_subnet_rules {} {}", subnet.host, subnet.subnet);
        Ok(())
    }

    fn add_service_rules(&self, service: &Service, vnid: u32) -> Result<()> {
        debug!("add_service_rules {}/{} vnid {vnid}", service.namespace, service.name);
        Ok(())
    }

    fn delete_service_rules(&self, service: &Service) -> Result<()> {
        debug!("delete_service_rules {}/{}", service.namespace, service.name);
        Ok(())
    }

    fn update_pod(&self, namespace: &str, name: &str, container_id: &str) -> Result<()> {
        debug!("update_pod {namespace}/{name} container {container_id}");
        Ok(())
    }
}
