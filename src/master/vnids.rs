use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::ControllerMetrics;
use crate::netid;
use crate::netutils::VnidAllocator;
use crate::registry::{Event, EventKind, Namespace, Registry, Revision, WriteOutcome};
use crate::{Error, Result};

/// Number of times a namespace update is retried after the first conflict.
const RETRY_COUNT: usize = 2;

/// Watches namespaces and keeps one NetNamespace record per namespace,
/// backed by the VNID allocator. The NetNamespace record is authoritative
/// for the assignment; the namespace annotations are only the channel
/// between administrators and this controller.
pub struct VnidController {
    registry: Arc<Registry>,
    allocator: VnidAllocator,
    global_namespaces: Vec<String>,
    metrics: ControllerMetrics,
}

impl VnidController {
    /// Pre-seeds the allocator from existing NetNamespace records so a
    /// restart re-derives occupancy from the registry.
    pub fn new(
        registry: Arc<Registry>,
        min: u32,
        max: u32,
        global_namespaces: Vec<String>,
    ) -> Result<Self> {
        let in_use: Vec<u32> = registry
            .net_namespaces()
            .list()
            .iter()
            .map(|stored| stored.record.net_id)
            .filter(|&id| id != netid::GLOBAL_VNID)
            .collect();
        let allocator = VnidAllocator::new(min, max, &in_use)?;
        Ok(Self {
            registry,
            allocator,
            global_namespaces,
            metrics: ControllerMetrics::new("vnids"),
        })
    }

    pub fn allocator(&self) -> &VnidAllocator {
        &self.allocator
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let mut watch = self.registry.namespaces().watch();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = watch.next() => match event {
                        Some(event) => self.handle(event),
                        None => break,
                    }
                }
            }
            warn!("namespace watch terminated, re-listing and resuming");
        }
    }

    pub fn handle(&self, event: Event<Namespace>) {
        self.metrics.count_run("namespace");
        let name = event.record.name.clone();
        let outcome = match event.kind {
            EventKind::Added | EventKind::Modified => self.add_or_update(&name),
            EventKind::Deleted => self.delete(&event.record),
        };
        if let Err(e) = outcome {
            self.metrics.count_failure("namespace", &e);
            error!("error reconciling vnid for namespace {name:?}: {e}");
        }
    }

    /// Assigns a VNID to the namespace if needed. Side effects performed
    /// before the commit point are registered on a compensation stack and
    /// unwound when a later step fails.
    pub fn add_or_update(&self, name: &str) -> Result<()> {
        let stored = match self.registry.namespaces().get(name) {
            Ok(stored) => stored,
            // deleted mid-reconcile
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut ns = stored.record;
        let revision = stored.revision;

        let mut tx = Tx::new();
        let user_requested;
        let id;
        match netid::requested_vnid(&ns)? {
            Some(requested) => {
                id = requested;
                user_requested = true;
                netid::clear_requested_vnid(&mut ns);
            }
            None => {
                user_requested = false;
                if netid::vnid(&ns)?.is_some() {
                    // already assigned and no new request: nothing to do
                    return Ok(());
                }
                if self.global_namespaces.iter().any(|g| g == name) {
                    id = netid::GLOBAL_VNID;
                } else {
                    id = self.allocator.allocate()?;
                    let allocator = self.allocator.clone();
                    tx.add(move || allocator.release(id));
                }
            }
        }

        // Only the global VNID or VNIDs that are already allocated may be
        // requested.
        if user_requested && id != netid::GLOBAL_VNID && !self.allocator.has(id) {
            return Err(Error::InvalidVnid(format!(
                "requested vnid {id} is not allocated"
            )));
        }

        netid::set_vnid(&mut ns, id)?;

        let outcome = self.registry.write_net_namespace(name, id)?;
        match outcome {
            WriteOutcome::Created => {
                let registry = self.registry.clone();
                let netns = name.to_owned();
                tx.add(move || registry.delete_net_namespace(&netns));
            }
            WriteOutcome::Updated { previous } => {
                let registry = self.registry.clone();
                let netns = name.to_owned();
                tx.add(move || registry.write_net_namespace(&netns, previous).map(|_| ()));
            }
            WriteOutcome::Unchanged => {}
        }

        self.update_namespace(ns, revision, id, user_requested)?;
        tx.commit();

        // A reassignment may leave the old vnid without any holder; release
        // it so the allocator stays consistent with the records.
        if let WriteOutcome::Updated { previous } = outcome {
            self.release_if_unused(name, previous);
        }
        Ok(())
    }

    fn release_if_unused(&self, name: &str, id: u32) {
        if id == netid::GLOBAL_VNID {
            return;
        }
        let still_in_use = self
            .registry
            .net_namespaces()
            .list()
            .iter()
            .any(|stored| stored.record.net_id == id);
        if still_in_use {
            return;
        }
        match self.allocator.release(id) {
            Ok(()) => info!("released vnid {id} formerly held by namespace {name:?}"),
            Err(e) => error!("error releasing vnid {id}: {e}"),
        }
    }

    /// Persists the annotated namespace with a bounded optimistic retry. A
    /// conflicting writer that assigned a different VNID wins; this
    /// reconcile fails loudly and its side effects are rolled back.
    fn update_namespace(
        &self,
        ns: Namespace,
        revision: Revision,
        id: u32,
        user_requested: bool,
    ) -> Result<()> {
        let name = ns.name.clone();
        let mut ns = ns;
        let mut revision = revision;
        for _ in 0..=RETRY_COUNT {
            match self.registry.namespaces().update(revision, ns.clone()) {
                Ok(_) => {
                    if user_requested {
                        info!("updated vnid {id} for namespace {name:?}");
                    } else {
                        info!("assigned vnid {id} to namespace {name:?}");
                    }
                    return Ok(());
                }
                // the namespace does not exist anymore
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if e.is_conflict() => {
                    let fresh = match self.registry.namespaces().get(&name) {
                        Ok(fresh) => fresh,
                        Err(e) if e.is_not_found() => return Ok(()),
                        Err(e) => return Err(e),
                    };
                    if let Some(current) = netid::vnid(&fresh.record)?
                        && current != id
                    {
                        return Err(Error::Reconcile(format!(
                            "vnid for namespace {name:?} changed to {current} mid-flight, \
                             refusing to overwrite with {id}"
                        )));
                    }
                    ns = fresh.record;
                    revision = fresh.revision;
                    if user_requested {
                        netid::clear_requested_vnid(&mut ns);
                    }
                    netid::set_vnid(&mut ns, id)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Reconcile(format!(
            "unable to update namespace {name:?} after {RETRY_COUNT} retries"
        )))
    }

    /// Releases the namespace's VNID unless another NetNamespace still holds
    /// it. Multiple namespaces may share a VNID because administrators can
    /// request an existing one.
    pub fn delete(&self, ns: &Namespace) -> Result<()> {
        let id = match self.registry.get_net_namespace(&ns.name) {
            Ok(netns) => Some(netns.net_id),
            // fall back to the final object's annotation
            Err(e) if e.is_not_found() => netid::vnid(ns)?,
            Err(e) => return Err(e),
        };
        let Some(id) = id else {
            return Ok(());
        };

        match self.registry.delete_net_namespace(&ns.name) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if id == netid::GLOBAL_VNID {
            return Ok(());
        }
        let still_in_use = self
            .registry
            .net_namespaces()
            .list()
            .iter()
            .any(|stored| stored.record.net_id == id);
        if still_in_use {
            info!("keeping vnid {id} of namespace {:?} (still in use)", ns.name);
            return Ok(());
        }
        self.allocator.release(id)?;
        info!("released vnid {id} for namespace {:?}", ns.name);
        Ok(())
    }
}

/// Ordered stack of compensating actions. Registered as each side effect
/// succeeds, unwound in reverse order when the reconcile fails before
/// `commit`.
struct Tx {
    rollback: Vec<Box<dyn FnOnce() -> Result<()> + Send>>,
}

impl Tx {
    fn new() -> Self {
        Self { rollback: Vec::new() }
    }

    fn add<F>(&mut self, undo: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.rollback.push(Box::new(undo));
    }

    fn commit(mut self) {
        self.rollback.clear();
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        while let Some(undo) = self.rollback.pop() {
            if let Err(e) = undo() {
                error!("unable to undo reconcile side effect: {e}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_controller(registry: &Arc<Registry>, min: u32, max: u32) -> VnidController {
        VnidController::new(registry.clone(), min, max, vec!["default".to_owned()]).unwrap()
    }

    fn create_namespace(registry: &Registry, name: &str) {
        registry.namespaces().create(Namespace::new(name)).unwrap();
    }

    fn assigned(registry: &Registry, name: &str) -> Option<u32> {
        netid::vnid(&registry.namespaces().get(name).unwrap().record).unwrap()
    }

    #[test]
    fn test_auto_assignment() {
        let registry = Arc::new(Registry::new());
        let controller = new_controller(&registry, 10, 20);

        for name in ["a", "b", "c"] {
            create_namespace(&registry, name);
            controller.add_or_update(name).unwrap();
        }

        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let id = assigned(&registry, name).unwrap();
            assert!((10..=20).contains(&id));
            assert_eq!(registry.get_net_namespace(name).unwrap().net_id, id);
            ids.push(id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let registry = Arc::new(Registry::new());
        let controller = new_controller(&registry, 10, 20);
        create_namespace(&registry, "web");

        controller.add_or_update("web").unwrap();
        let ns_before = registry.namespaces().get("web").unwrap();
        let netns_before = registry.net_namespaces().get("web").unwrap();

        controller.add_or_update("web").unwrap();
        assert_eq!(registry.namespaces().get("web").unwrap().revision, ns_before.revision);
        assert_eq!(
            registry.net_namespaces().get("web").unwrap().revision,
            netns_before.revision
        );
    }

    #[test]
    fn test_global_namespace() {
        let registry = Arc::new(Registry::new());
        let controller = new_controller(&registry, 10, 20);
        create_namespace(&registry, "default");

        controller.add_or_update("default").unwrap();
        assert_eq!(assigned(&registry, "default"), Some(netid::GLOBAL_VNID));
        assert_eq!(
            registry.get_net_namespace("default").unwrap().net_id,
            netid::GLOBAL_VNID
        );
    }

    #[test]
    fn test_requested_vnid_shares_allocation() {
        let registry = Arc::new(Registry::new());
        let controller = new_controller(&registry, 10, 20);
        create_namespace(&registry, "a");
        controller.add_or_update("a").unwrap();
        let id = assigned(&registry, "a").unwrap();

        create_namespace(&registry, "b");
        let stored = registry.namespaces().get("b").unwrap();
        let mut ns = stored.record;
        netid::set_requested_vnid(&mut ns, id).unwrap();
        registry.namespaces().update(stored.revision, ns).unwrap();

        controller.add_or_update("b").unwrap();
        let b = registry.namespaces().get("b").unwrap().record;
        assert_eq!(netid::vnid(&b).unwrap(), Some(id));
        assert_eq!(netid::requested_vnid(&b).unwrap(), None);
        assert!(controller.allocator().has(id));

        // deleting one holder keeps the shared vnid allocated
        let a = registry.namespaces().get("a").unwrap().record;
        registry.namespaces().delete("a").unwrap();
        controller.delete(&a).unwrap();
        assert!(controller.allocator().has(id));

        // deleting the last holder releases it
        let b = registry.namespaces().get("b").unwrap().record;
        registry.namespaces().delete("b").unwrap();
        controller.delete(&b).unwrap();
        assert!(!controller.allocator().has(id));
    }

    #[test]
    fn test_requested_global_vnid() {
        let registry = Arc::new(Registry::new());
        let controller = new_controller(&registry, 10, 20);
        create_namespace(&registry, "x");
        controller.add_or_update("x").unwrap();
        let auto = assigned(&registry, "x").unwrap();

        let stored = registry.namespaces().get("x").unwrap();
        let mut ns = stored.record;
        netid::set_requested_vnid(&mut ns, netid::GLOBAL_VNID).unwrap();
        registry.namespaces().update(stored.revision, ns).unwrap();

        controller.add_or_update("x").unwrap();
        assert_eq!(assigned(&registry, "x"), Some(netid::GLOBAL_VNID));
        assert_eq!(registry.get_net_namespace("x").unwrap().net_id, netid::GLOBAL_VNID);
        // the abandoned auto-assigned id goes back to the pool
        assert!(!controller.allocator().has(auto));
    }

    #[test]
    fn test_reassignment_keeps_shared_vnid() {
        let registry = Arc::new(Registry::new());
        let controller = new_controller(&registry, 10, 20);
        create_namespace(&registry, "a");
        controller.add_or_update("a").unwrap();
        let shared = assigned(&registry, "a").unwrap();

        // b shares a's vnid, then gets moved to the global network; the
        // shared vnid must stay allocated for a
        create_namespace(&registry, "b");
        let stored = registry.namespaces().get("b").unwrap();
        let mut ns = stored.record;
        netid::set_requested_vnid(&mut ns, shared).unwrap();
        registry.namespaces().update(stored.revision, ns).unwrap();
        controller.add_or_update("b").unwrap();

        let stored = registry.namespaces().get("b").unwrap();
        let mut ns = stored.record;
        netid::set_requested_vnid(&mut ns, netid::GLOBAL_VNID).unwrap();
        registry.namespaces().update(stored.revision, ns).unwrap();
        controller.add_or_update("b").unwrap();

        assert_eq!(registry.get_net_namespace("b").unwrap().net_id, netid::GLOBAL_VNID);
        assert!(controller.allocator().has(shared));
    }

    #[test]
    fn test_requested_unallocated_vnid_fails_without_changes() {
        let registry = Arc::new(Registry::new());
        let controller = new_controller(&registry, 10, 20);
        create_namespace(&registry, "web");
        let stored = registry.namespaces().get("web").unwrap();
        let mut ns = stored.record;
        netid::set_requested_vnid(&mut ns, 15).unwrap();
        registry.namespaces().update(stored.revision, ns).unwrap();
        let before = registry.namespaces().get("web").unwrap();

        let err = controller.add_or_update("web").unwrap_err();
        assert!(matches!(err, Error::InvalidVnid(_)));

        let after = registry.namespaces().get("web").unwrap();
        assert_eq!(after.revision, before.revision);
        assert_eq!(netid::requested_vnid(&after.record).unwrap(), Some(15));
        assert!(registry.get_net_namespace("web").unwrap_err().is_not_found());
    }

    #[test]
    fn test_conflict_gives_up_when_another_writer_assigned() {
        let registry = Arc::new(Registry::new());
        let controller = new_controller(&registry, 10, 20);
        create_namespace(&registry, "web");
        let stored = registry.namespaces().get("web").unwrap();

        let ours = controller.allocator().allocate().unwrap();
        let mut ns = stored.record.clone();
        netid::set_vnid(&mut ns, ours).unwrap();

        // another writer assigns a different vnid between our read and write
        let mut foreign = stored.record.clone();
        netid::set_vnid(&mut foreign, 19).unwrap();
        registry.namespaces().update(stored.revision, foreign).unwrap();

        let err = controller
            .update_namespace(ns, stored.revision, ours, false)
            .unwrap_err();
        assert!(matches!(err, Error::Reconcile(_)));
        assert_eq!(assigned(&registry, "web"), Some(19));
    }

    #[test]
    fn test_conflict_retries_after_unrelated_write() {
        let registry = Arc::new(Registry::new());
        let controller = new_controller(&registry, 10, 20);
        create_namespace(&registry, "web");
        let stored = registry.namespaces().get("web").unwrap();

        let ours = controller.allocator().allocate().unwrap();
        let mut ns = stored.record.clone();
        netid::set_vnid(&mut ns, ours).unwrap();

        // an unrelated writer bumps the revision without touching the vnid
        let mut labeled = stored.record.clone();
        labeled.labels.insert("team".into(), "net".into());
        registry.namespaces().update(stored.revision, labeled).unwrap();

        controller
            .update_namespace(ns, stored.revision, ours, false)
            .unwrap();
        let after = registry.namespaces().get("web").unwrap().record;
        assert_eq!(netid::vnid(&after).unwrap(), Some(ours));
        assert_eq!(after.labels.get("team").map(String::as_str), Some("net"));
    }

    #[test]
    fn test_tx_unwinds_in_reverse_order() {
        use std::sync::Mutex;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tx = Tx::new();
        for step in [1, 2, 3] {
            let order = order.clone();
            tx.add(move || {
                order.lock().unwrap().push(step);
                Ok(())
            });
        }
        drop(tx);
        assert_eq!(*order.lock().unwrap(), [3, 2, 1]);

        let committed = Arc::new(Mutex::new(Vec::new()));
        let mut tx = Tx::new();
        {
            let committed = committed.clone();
            tx.add(move || {
                committed.lock().unwrap().push(1);
                Ok(())
            });
        }
        tx.commit();
        assert!(committed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_namespace_deleted_mid_reconcile() {
        let registry = Arc::new(Registry::new());
        let controller = new_controller(&registry, 10, 20);
        // reconciling a namespace that is already gone succeeds silently
        controller.add_or_update("ghost").unwrap();

        // deleting a namespace that never had a vnid succeeds silently
        controller.delete(&Namespace::new("ghost")).unwrap();
    }

    #[test]
    fn test_restart_reseeds_from_registry() {
        let registry = Arc::new(Registry::new());
        let controller = new_controller(&registry, 10, 20);
        create_namespace(&registry, "web");
        controller.add_or_update("web").unwrap();
        let id = assigned(&registry, "web").unwrap();

        let restarted = new_controller(&registry, 10, 20);
        assert!(restarted.allocator().has(id));
        assert_ne!(restarted.allocator().allocate().unwrap(), id);
    }
}
