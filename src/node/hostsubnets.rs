use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::dataplane::Dataplane;
use crate::netutils::{self, NetworkInfo};
use crate::registry::{EventKind, Registry};

/// Installs forwarding rules for the subnets of remote nodes. Events for the
/// local node are skipped; its subnet was handled during SDN setup.
pub(crate) async fn watch_host_subnets(
    registry: Arc<Registry>,
    node_name: String,
    network: NetworkInfo,
    dataplane: Arc<dyn Dataplane>,
    cancel: CancellationToken,
) {
    loop {
        let mut watch = registry.host_subnets().watch();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = watch.next() => {
                    let Some(event) = event else { break };
                    let subnet = event.record;
                    if subnet.host == node_name {
                        continue;
                    }
                    match event.kind {
                        EventKind::Added | EventKind::Modified => {
                            if let Err(e) =
                                netutils::validate_node_ip(&subnet.host_ip, &network.cluster_network)
                            {
                                error!("skipping HostSubnet {:?}: {e}", subnet.name);
                                continue;
                            }
                            if let Err(e) = dataplane.add_host_subnet_rules(&subnet) {
                                error!("error adding rules for subnet of {:?}: {e}", subnet.host);
                            }
                        }
                        EventKind::Deleted => {
                            if let Err(e) = dataplane.delete_host_subnet_rules(&subnet) {
                                error!("error deleting rules for subnet of {:?}: {e}", subnet.host);
                            }
                        }
                    }
                }
            }
        }
        warn!("hostsubnet watch terminated, re-listing and resuming");
    }
}
