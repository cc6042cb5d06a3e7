use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use ahash::{HashMap, HashMapExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::netutils::NetworkInfo;
use crate::registry::{Endpoints, EventKind, PodPhase, Registry};

/// Pod-IP to namespace map used by endpoint filtering. Clones share the same
/// map.
#[derive(Clone)]
pub struct PodTracker {
    shared: Arc<Mutex<HashMap<Ipv4Addr, String>>>,
}

impl PodTracker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Seeds the map from existing pod records so endpoint filtering works
    /// before the watcher has caught up.
    pub fn populate(&self, registry: &Registry) {
        for stored in registry.pods().list() {
            let pod = stored.record;
            if let Some(ip) = pod.ip
                && pod.phase == PodPhase::Running
            {
                self.insert(ip, &pod.namespace);
            }
        }
    }

    pub fn insert(&self, ip: Ipv4Addr, namespace: &str) {
        self.shared.lock().unwrap().insert(ip, namespace.to_owned());
    }

    pub fn remove(&self, ip: Ipv4Addr) {
        self.shared.lock().unwrap().remove(&ip);
    }

    pub fn namespace_of(&self, ip: Ipv4Addr) -> Option<String> {
        self.shared.lock().unwrap().get(&ip).cloned()
    }
}

impl Default for PodTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) async fn watch_pods(registry: Arc<Registry>, tracker: PodTracker, cancel: CancellationToken) {
    loop {
        let mut watch = registry.pods().watch();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = watch.next() => {
                    let Some(event) = event else { break };
                    let pod = event.record;
                    match event.kind {
                        EventKind::Added | EventKind::Modified => {
                            if let Some(ip) = pod.ip {
                                tracker.insert(ip, &pod.namespace);
                            }
                        }
                        EventKind::Deleted => {
                            if let Some(ip) = pod.ip {
                                tracker.remove(ip);
                            }
                        }
                    }
                }
            }
        }
        warn!("pod watch terminated, re-listing and resuming");
    }
}

/// Drops endpoint addresses a namespace must not publish: addresses inside
/// the service network (misconfiguration), and addresses inside the cluster
/// network whose pod is unknown or belongs to another namespace. Endpoints
/// objects left without addresses are dropped entirely.
pub fn filter_endpoints(
    endpoints: &[Endpoints],
    tracker: &PodTracker,
    network: &NetworkInfo,
) -> Vec<Endpoints> {
    let mut filtered = Vec::with_capacity(endpoints.len());
    for ep in endpoints {
        let mut kept = Vec::with_capacity(ep.addresses.len());
        for &addr in &ep.addresses {
            if network.service_network.contains(addr) {
                warn!(
                    "service {:?} in namespace {:?} has an endpoint inside the service network ({})",
                    ep.name, ep.namespace, addr
                );
                continue;
            }
            if network.cluster_network.contains(addr) {
                match tracker.namespace_of(addr) {
                    None => {
                        warn!(
                            "service {:?} in namespace {:?} has an endpoint pointing to a non-existent pod ({})",
                            ep.name, ep.namespace, addr
                        );
                        continue;
                    }
                    Some(pod_namespace) if pod_namespace != ep.namespace => {
                        warn!(
                            "service {:?} in namespace {:?} has an endpoint pointing to pod {} in namespace {:?}",
                            ep.name, ep.namespace, addr, pod_namespace
                        );
                        continue;
                    }
                    Some(_) => {}
                }
            }
            kept.push(addr);
        }
        if !kept.is_empty() {
            filtered.push(Endpoints {
                name: ep.name.clone(),
                namespace: ep.namespace.clone(),
                addresses: kept,
            });
        }
    }
    filtered
}
