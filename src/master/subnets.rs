use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::ControllerMetrics;
use crate::netutils::{self, NetworkInfo, SubnetAllocator};
use crate::registry::{Event, EventKind, HostSubnet, Node, Registry};
use crate::Result;

/// Watches nodes and keeps one HostSubnet record per node, backed by the
/// subnet allocator. The allocator is authoritative for what is free; the
/// registry is authoritative for what is assigned.
pub struct SubnetController {
    registry: Arc<Registry>,
    allocator: SubnetAllocator,
    network: NetworkInfo,
    metrics: ControllerMetrics,
}

impl SubnetController {
    /// Builds the allocator pre-seeded with the subnets of all existing
    /// HostSubnet records, so a restart re-derives occupancy from the
    /// registry.
    pub fn new(registry: Arc<Registry>, network: NetworkInfo) -> Result<Self> {
        let in_use: Vec<_> = registry
            .host_subnets()
            .list()
            .iter()
            .map(|stored| stored.record.subnet)
            .collect();
        let allocator = SubnetAllocator::new(
            network.cluster_network,
            network.host_subnet_bits,
            &in_use,
        )?;
        Ok(Self {
            registry,
            allocator,
            network,
            metrics: ControllerMetrics::new("subnets"),
        })
    }

    pub fn allocator(&self) -> &SubnetAllocator {
        &self.allocator
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let mut watch = self.registry.nodes().watch();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = watch.next() => match event {
                        Some(event) => self.handle(event),
                        None => break,
                    }
                }
            }
            warn!("node watch terminated, re-listing and resuming");
        }
    }

    pub fn handle(&self, event: Event<Node>) {
        self.metrics.count_run("node");
        let node = event.record;
        let outcome = match event.kind {
            EventKind::Added | EventKind::Modified => self.add_or_update_node(&node),
            EventKind::Deleted => self.delete_node(&node),
        };
        if let Err(e) = outcome {
            self.metrics.count_failure("node", &e);
            error!("error reconciling subnet for node {:?}: {e}", node.name);
        }
    }

    fn add_or_update_node(&self, node: &Node) -> Result<()> {
        netutils::validate_node_ip(&node.ip, &self.network.cluster_network)?;

        match self.registry.host_subnets().get(&node.name) {
            Ok(stored) => {
                if stored.record.host_ip == node.ip {
                    return Ok(());
                }
                self.update_node_ip(node, stored.record)
            }
            Err(e) if e.is_not_found() => self.add_node(node),
            Err(e) => Err(e),
        }
    }

    /// The node re-appeared with a new IP: recreate the record, keeping its
    /// subnet when it is still part of the cluster network.
    fn update_node_ip(&self, node: &Node, previous: HostSubnet) -> Result<()> {
        let subnet = if self.network.cluster_network.contains(previous.subnet.network()) {
            previous.subnet
        } else {
            warn!(
                "subnet {} of node {:?} is no longer part of cluster network {}, reallocating",
                previous.subnet, node.name, self.network.cluster_network
            );
            self.allocator.allocate()?
        };

        self.registry.host_subnets().delete(&node.name)?;
        let record = HostSubnet {
            name: node.name.clone(),
            host: node.name.clone(),
            host_ip: node.ip.clone(),
            subnet,
        };
        if let Err(e) = self.registry.host_subnets().create(record) {
            if let Err(re) = self.allocator.release(subnet) {
                error!("error releasing subnet {subnet}: {re}");
            }
            return Err(e);
        }
        info!("updated HostSubnet for node {:?} to ip {}", node.name, node.ip);
        Ok(())
    }

    fn add_node(&self, node: &Node) -> Result<()> {
        let subnet = self.allocator.allocate()?;
        let record = HostSubnet {
            name: node.name.clone(),
            host: node.name.clone(),
            host_ip: node.ip.clone(),
            subnet,
        };
        if let Err(e) = self.registry.host_subnets().create(record) {
            if let Err(re) = self.allocator.release(subnet) {
                error!("error releasing subnet {subnet}: {re}");
            }
            return Err(e);
        }
        info!("assigned subnet {} to node {:?}", subnet, node.name);
        Ok(())
    }

    fn delete_node(&self, node: &Node) -> Result<()> {
        let stored = self.registry.host_subnets().get(&node.name)?;
        // a subnet from an older cluster network cannot be released; the
        // record still has to go
        if let Err(e) = self.allocator.release(stored.record.subnet) {
            error!("error releasing subnet {}: {e}", stored.record.subnet);
        }
        self.registry.host_subnets().delete(&node.name)?;
        info!(
            "released subnet {} of node {:?}",
            stored.record.subnet, node.name
        );
        Ok(())
    }
}
