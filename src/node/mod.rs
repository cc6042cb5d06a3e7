//! The node view: runs on every node, watches the registry and drives the
//! dataplane hooks. Independent of the master.

mod hostsubnets;
mod pods;
mod services;
mod vnid_table;

pub use pods::PodTracker;
pub use vnid_table::VnidTable;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dataplane::Dataplane;
use crate::netid;
use crate::netutils::{self, NetworkInfo};
use crate::registry::{Endpoints, EventKind, HostSubnet, Registry};
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_name: String,
    pub mtu: u32,
    /// Self-subnet acquisition: 60 attempts at 500 ms gives the master 30
    /// seconds to allocate our subnet.
    pub subnet_attempts: u32,
    pub subnet_retry_interval: Duration,
    /// Bounds for the namespace-to-VNID lookup retry (about 2 seconds).
    pub vnid_retries: u32,
    pub vnid_retry_interval: Duration,
    /// Pod-network-ready wait: 12 intervals of 10 seconds.
    pub ready_attempts: u32,
    pub ready_log_interval: Duration,
}

impl NodeConfig {
    pub fn new(node_name: impl Into<String>, mtu: u32) -> Self {
        Self {
            node_name: node_name.into(),
            mtu,
            subnet_attempts: 60,
            subnet_retry_interval: Duration::from_millis(500),
            vnid_retries: 20,
            vnid_retry_interval: Duration::from_millis(100),
            ready_attempts: 12,
            ready_log_interval: Duration::from_secs(10),
        }
    }
}

/// Per-node state: the local namespace-to-VNID table, the pod-IP map for
/// endpoint filtering and the pod-network-ready signal. Clones share all of
/// it, so one clone can run while others consult the tables.
#[derive(Clone)]
pub struct NodeView {
    config: NodeConfig,
    registry: Arc<Registry>,
    dataplane: Arc<dyn Dataplane>,
    vnid_table: VnidTable,
    pod_tracker: PodTracker,
    network: Arc<OnceLock<NetworkInfo>>,
    local_subnet: Arc<OnceLock<HostSubnet>>,
    ready: CancellationToken,
}

impl NodeView {
    pub fn new(config: NodeConfig, registry: Arc<Registry>, dataplane: Arc<dyn Dataplane>) -> Self {
        let vnid_table = VnidTable::new(registry.clone())
            .with_retry(config.vnid_retries, config.vnid_retry_interval);
        Self {
            config,
            registry,
            dataplane,
            vnid_table,
            pod_tracker: PodTracker::new(),
            network: Arc::new(OnceLock::new()),
            local_subnet: Arc::new(OnceLock::new()),
            ready: CancellationToken::new(),
        }
    }

    /// Brings the local pod network up, then watches host subnets,
    /// net namespaces, services and pods until cancelled. `setup_sdn` runs
    /// exactly once; its success closes the ready signal.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.dataplane.start_node(self.config.mtu)?;

        let local_subnet = self.acquire_self_subnet().await?;
        let network = self.registry.network_info()?;
        netutils::validate_node_ip(&local_subnet.host_ip, &network.cluster_network)?;

        let reconfigured = self.dataplane.setup_sdn(
            local_subnet.subnet,
            network.cluster_network,
            network.service_network,
            self.config.mtu,
        )?;
        if reconfigured {
            info!("dataplane reconfigured for local subnet {}", local_subnet.subnet);
        }
        let _ = self.local_subnet.set(local_subnet);
        let _ = self.network.set(network);
        self.ready.cancel();
        info!("pod network is ready");

        // Populate the lookup tables synchronously so pre-existing services
        // and endpoints resolve without hitting the retry paths.
        self.vnid_table.populate();
        self.pod_tracker.populate(&self.registry);

        tokio::spawn(hostsubnets::watch_host_subnets(
            self.registry.clone(),
            self.config.node_name.clone(),
            network,
            self.dataplane.clone(),
            cancel.child_token(),
        ));
        tokio::spawn(watch_net_namespaces(
            self.registry.clone(),
            self.config.node_name.clone(),
            self.vnid_table.clone(),
            self.dataplane.clone(),
            cancel.child_token(),
        ));
        tokio::spawn(services::watch_services(
            self.registry.clone(),
            self.vnid_table.clone(),
            self.dataplane.clone(),
            cancel.child_token(),
        ));
        tokio::spawn(pods::watch_pods(
            self.registry.clone(),
            self.pod_tracker.clone(),
            cancel.child_token(),
        ));

        cancel.cancelled().await;
        Ok(())
    }

    async fn acquire_self_subnet(&self) -> Result<HostSubnet> {
        let name = &self.config.node_name;
        for attempt in 0..self.config.subnet_attempts {
            match self.registry.host_subnets().get(name) {
                Ok(stored) => return Ok(stored.record),
                Err(e) if e.is_not_found() => {
                    if attempt + 1 < self.config.subnet_attempts {
                        warn!("could not find an allocated subnet for node {name:?}, waiting...");
                        sleep(self.config.subnet_retry_interval).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Unavailable(format!(
            "failed to get subnet for this host {name:?}"
        )))
    }

    /// One-shot signal other local components may clone and await.
    pub fn ready_token(&self) -> CancellationToken {
        self.ready.clone()
    }

    pub async fn wait_for_pod_network_ready(&self) -> Result<()> {
        for _ in 0..self.config.ready_attempts {
            tokio::select! {
                _ = self.ready.cancelled() => return Ok(()),
                _ = sleep(self.config.ready_log_interval) => {
                    info!("waiting for sdn pod network to be ready...");
                }
            }
        }
        Err(Error::Unavailable("sdn pod network is not ready".into()))
    }

    pub fn vnid_table(&self) -> &VnidTable {
        &self.vnid_table
    }

    pub fn local_subnet(&self) -> Option<&HostSubnet> {
        self.local_subnet.get()
    }

    /// Endpoint filtering for the proxy layer; available once the pod
    /// network is ready.
    pub fn filter_endpoints(&self, endpoints: &[Endpoints]) -> Result<Vec<Endpoints>> {
        let Some(network) = self.network.get() else {
            return Err(Error::Unavailable("pod network is not ready".into()));
        };
        Ok(pods::filter_endpoints(endpoints, &self.pod_tracker, network))
    }
}

async fn watch_net_namespaces(
    registry: Arc<Registry>,
    node_name: String,
    table: VnidTable,
    dataplane: Arc<dyn Dataplane>,
    cancel: CancellationToken,
) {
    loop {
        let mut watch = registry.net_namespaces().watch();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = watch.next() => {
                    let Some(event) = event else { break };
                    let netns = event.record;
                    match event.kind {
                        EventKind::Added | EventKind::Modified => {
                            // skip when the vnid did not change
                            if table.get(&netns.name) == Some(netns.net_id) {
                                continue;
                            }
                            table.set(&netns.name, netns.net_id);
                            if let Err(e) = update_pod_network(
                                &registry, dataplane.as_ref(), &node_name, &netns.name, netns.net_id,
                            ) {
                                error!(
                                    "failed to update pod network for namespace {:?}: {e}",
                                    netns.name
                                );
                            }
                        }
                        EventKind::Deleted => {
                            // a namespace without a NetNamespace belongs to
                            // the global network
                            if let Err(e) = update_pod_network(
                                &registry, dataplane.as_ref(), &node_name, &netns.name, netid::GLOBAL_VNID,
                            ) {
                                error!(
                                    "failed to update pod network for namespace {:?}: {e}",
                                    netns.name
                                );
                            }
                            table.unset(&netns.name);
                        }
                    }
                }
            }
        }
        warn!("netnamespace watch terminated, re-listing and resuming");
    }
}

/// Re-programs every local running pod and every service in the namespace
/// with its new VNID.
fn update_pod_network(
    registry: &Registry,
    dataplane: &dyn Dataplane,
    node_name: &str,
    namespace: &str,
    vnid: u32,
) -> Result<()> {
    for pod in registry.running_pods_on(node_name, namespace) {
        dataplane.update_pod(&pod.namespace, &pod.name, &pod.container_id)?;
    }
    for service in registry.services_in(namespace) {
        if let Err(e) = dataplane.delete_service_rules(&service) {
            error!("error deleting rules for service {}/{}: {e}", service.namespace, service.name);
        }
        if let Err(e) = dataplane.add_service_rules(&service, vnid) {
            error!("error adding rules for service {}/{}: {e}", service.namespace, service.name);
        }
    }
    Ok(())
}
