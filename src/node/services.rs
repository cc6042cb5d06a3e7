use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::vnid_table::VnidTable;
use crate::dataplane::Dataplane;
use crate::registry::{EventKind, Registry, Service};

/// A service's rules need reinstalling when its port list changed.
pub(crate) fn is_service_changed(old: &Service, new: &Service) -> bool {
    if old.ports.len() != new.ports.len() {
        return true;
    }
    old.ports
        .iter()
        .zip(new.ports.iter())
        .any(|(a, b)| a.protocol != b.protocol || a.port != b.port)
}

pub(crate) async fn watch_services(
    registry: Arc<Registry>,
    table: VnidTable,
    dataplane: Arc<dyn Dataplane>,
    cancel: CancellationToken,
) {
    // UID-keyed cache of the services whose rules are installed
    let mut services: HashMap<String, Service> = HashMap::new();
    loop {
        let mut watch = registry.services().watch();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = watch.next() => {
                    let Some(event) = event else { break };
                    let service = event.record;
                    // ignore headless services
                    if !service.is_ip_set() {
                        continue;
                    }
                    match event.kind {
                        EventKind::Added | EventKind::Modified => {
                            let vnid = match table.get_with_retry(&service.namespace).await {
                                Ok(vnid) => vnid,
                                Err(e) => {
                                    error!(
                                        "skipping event for service {}/{}: {e}",
                                        service.namespace, service.name
                                    );
                                    continue;
                                }
                            };
                            if let Some(old) = services.get(&service.uid) {
                                if !is_service_changed(old, &service) {
                                    continue;
                                }
                                if let Err(e) = dataplane.delete_service_rules(old) {
                                    error!(
                                        "error deleting rules for service {}/{}: {e}",
                                        old.namespace, old.name
                                    );
                                }
                            }
                            services.insert(service.uid.clone(), service.clone());
                            if let Err(e) = dataplane.add_service_rules(&service, vnid) {
                                error!(
                                    "error adding rules for service {}/{}: {e}",
                                    service.namespace, service.name
                                );
                            }
                        }
                        EventKind::Deleted => {
                            services.remove(&service.uid);
                            if let Err(e) = dataplane.delete_service_rules(&service) {
                                error!(
                                    "error deleting rules for service {}/{}: {e}",
                                    service.namespace, service.name
                                );
                            }
                        }
                    }
                }
            }
        }
        warn!("service watch terminated, re-listing and resuming");
    }
}
