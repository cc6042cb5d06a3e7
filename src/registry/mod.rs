//! The registry the reconcilers consume: strongly consistent record storage
//! with optimistic concurrency and resumable watch streams, one collection
//! per record kind.

mod records;
mod store;

pub use records::{
    CLUSTER_NETWORK_NAME, ClusterNetwork, Endpoints, HostSubnet, Namespace, NetNamespace, Node,
    Pod, PodPhase, Protocol, Record, Service, ServicePort,
};
pub use store::{Collection, Event, EventKind, Revision, Stored, Watch};

use crate::netutils::NetworkInfo;
use crate::Result;

pub struct Registry {
    cluster_networks: Collection<ClusterNetwork>,
    host_subnets: Collection<HostSubnet>,
    net_namespaces: Collection<NetNamespace>,
    namespaces: Collection<Namespace>,
    nodes: Collection<Node>,
    services: Collection<Service>,
    pods: Collection<Pod>,
}

/// What a create-or-update helper actually did, so callers can register the
/// matching compensation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated { previous: u32 },
    Unchanged,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            cluster_networks: Collection::new(),
            host_subnets: Collection::new(),
            net_namespaces: Collection::new(),
            namespaces: Collection::new(),
            nodes: Collection::new(),
            services: Collection::new(),
            pods: Collection::new(),
        }
    }

    pub fn host_subnets(&self) -> &Collection<HostSubnet> {
        &self.host_subnets
    }

    pub fn net_namespaces(&self) -> &Collection<NetNamespace> {
        &self.net_namespaces
    }

    pub fn namespaces(&self) -> &Collection<Namespace> {
        &self.namespaces
    }

    pub fn nodes(&self) -> &Collection<Node> {
        &self.nodes
    }

    pub fn services(&self) -> &Collection<Service> {
        &self.services
    }

    pub fn pods(&self) -> &Collection<Pod> {
        &self.pods
    }

    /// The cluster network configuration as validated parameters.
    pub fn network_info(&self) -> Result<NetworkInfo> {
        let stored = self.cluster_networks.get(CLUSTER_NETWORK_NAME)?;
        Ok(NetworkInfo::from_record(&stored.record))
    }

    /// Persists the cluster network configuration, replacing a differing
    /// record and leaving a matching one untouched.
    pub fn write_cluster_network(&self, network: &NetworkInfo) -> Result<()> {
        let record = ClusterNetwork {
            name: CLUSTER_NETWORK_NAME.to_owned(),
            network: network.cluster_network,
            host_subnet_bits: network.host_subnet_bits,
            service_network: network.service_network,
        };
        match self.cluster_networks.get(CLUSTER_NETWORK_NAME) {
            Ok(stored) => {
                if stored.record == record {
                    return Ok(());
                }
                self.cluster_networks.update(stored.revision, record)?;
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.cluster_networks.create(record)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_net_namespace(&self, name: &str) -> Result<NetNamespace> {
        Ok(self.net_namespaces.get(name)?.record)
    }

    /// Creates or updates the NetNamespace record for `name`, reporting what
    /// was done. An already-matching record is left untouched.
    pub fn write_net_namespace(&self, name: &str, net_id: u32) -> Result<WriteOutcome> {
        match self.net_namespaces.get(name) {
            Ok(stored) => {
                if stored.record.net_id == net_id {
                    return Ok(WriteOutcome::Unchanged);
                }
                let previous = stored.record.net_id;
                self.net_namespaces.update(
                    stored.revision,
                    NetNamespace {
                        name: name.to_owned(),
                        net_id,
                    },
                )?;
                Ok(WriteOutcome::Updated { previous })
            }
            Err(e) if e.is_not_found() => {
                self.net_namespaces.create(NetNamespace {
                    name: name.to_owned(),
                    net_id,
                })?;
                Ok(WriteOutcome::Created)
            }
            Err(e) => Err(e),
        }
    }

    pub fn delete_net_namespace(&self, name: &str) -> Result<()> {
        self.net_namespaces.delete(name)
    }

    /// Running pods scheduled on `node` in `namespace`.
    pub fn running_pods_on(&self, node: &str, namespace: &str) -> Vec<Pod> {
        self.pods
            .list()
            .into_iter()
            .map(|stored| stored.record)
            .filter(|pod| {
                pod.node_name == node
                    && pod.namespace == namespace
                    && pod.phase == PodPhase::Running
            })
            .collect()
    }

    /// Services with a cluster IP in `namespace`; headless services are
    /// skipped.
    pub fn services_in(&self, namespace: &str) -> Vec<Service> {
        self.services
            .list()
            .into_iter()
            .map(|stored| stored.record)
            .filter(|service| service.namespace == namespace && service.is_ip_set())
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
