//! Master-side reconcilers: node events drive host-subnet allocation,
//! namespace events drive VNID allocation.

mod subnets;
mod vnids;

pub use subnets::SubnetController;
pub use vnids::VnidController;

use std::sync::Arc;

use ipnetwork::Ipv4Network;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;
use crate::dataplane::Dataplane;
use crate::netid;
use crate::netutils::{self, NetworkInfo};
use crate::registry::Registry;

#[derive(Clone, Debug)]
pub struct MasterConfig {
    pub cluster_cidr: String,
    pub host_subnet_bits: u32,
    pub service_cidr: String,
    pub vnid_min: u32,
    pub vnid_max: u32,
    /// Namespaces reserved as global; "default" is always one of them.
    pub global_namespaces: Vec<String>,
    /// Local interface networks, cross-checked against the cluster and
    /// service networks at startup.
    pub host_networks: Vec<Ipv4Network>,
}

impl MasterConfig {
    pub fn new(cluster_cidr: impl Into<String>, host_subnet_bits: u32, service_cidr: impl Into<String>) -> Self {
        Self {
            cluster_cidr: cluster_cidr.into(),
            host_subnet_bits,
            service_cidr: service_cidr.into(),
            vnid_min: netid::MIN_VNID,
            vnid_max: netid::MAX_VNID,
            global_namespaces: vec!["default".to_owned()],
            host_networks: Vec::new(),
        }
    }
}

/// Validates and persists the cluster network, builds the allocators from
/// persisted state and runs both master controllers until cancelled.
pub async fn start(
    config: MasterConfig,
    registry: Arc<Registry>,
    dataplane: Arc<dyn Dataplane>,
    cancel: CancellationToken,
) -> Result<()> {
    let network = NetworkInfo::validate(
        &config.cluster_cidr,
        config.host_subnet_bits,
        &config.service_cidr,
    )?;

    match registry.network_info() {
        Ok(stored) if !network.changed(&stored) => {}
        Ok(stored) => {
            info!(
                "cluster network configuration changed from {}/{} to {}/{}",
                stored.cluster_network, stored.host_subnet_bits,
                network.cluster_network, network.host_subnet_bits,
            );
            registry.write_cluster_network(&network)?;
        }
        Err(e) if e.is_not_found() => registry.write_cluster_network(&network)?,
        Err(e) => return Err(e),
    }
    validate_network_config(&registry, &network, &config.host_networks);

    dataplane.start_master(network.cluster_network, config.host_subnet_bits)?;

    let subnet_controller = SubnetController::new(registry.clone(), network)?;
    let vnid_controller = VnidController::new(
        registry.clone(),
        config.vnid_min,
        config.vnid_max,
        config.global_namespaces.clone(),
    )?;

    let subnets = tokio::spawn(subnet_controller.run(cancel.child_token()));
    let vnids = tokio::spawn(vnid_controller.run(cancel.child_token()));
    let (s, v) = tokio::join!(subnets, vnids);
    if let Err(e) = s {
        error!("subnet controller task failed to complete: {e}");
    }
    if let Err(e) = v {
        error!("vnid controller task failed to complete: {e}");
    }
    Ok(())
}

/// Cross-validates the configured networks against host interfaces and
/// pre-existing records. Violations are reported but do not abort startup.
fn validate_network_config(registry: &Registry, network: &NetworkInfo, host_networks: &[Ipv4Network]) {
    for host_network in host_networks {
        if netutils::networks_overlap(*host_network, network.cluster_network) {
            error!(
                "host network {} conflicts with cluster network {}",
                host_network, network.cluster_network
            );
        }
        if netutils::networks_overlap(*host_network, network.service_network) {
            error!(
                "host network {} conflicts with service network {}",
                host_network, network.service_network
            );
        }
    }

    for stored in registry.host_subnets().list() {
        let subnet = &stored.record;
        if !network.cluster_network.contains(subnet.subnet.network()) {
            error!(
                "existing node subnet {} of {} is not part of cluster network {}",
                subnet.subnet, subnet.host, network.cluster_network
            );
        }
    }

    for stored in registry.services().list() {
        let service = &stored.record;
        if let Some(ip) = service.cluster_ip
            && !network.service_network.contains(ip)
        {
            error!(
                "existing service {}/{} with ip {} is not part of service network {}",
                service.namespace, service.name, ip, network.service_network
            );
        }
    }
}
