use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use tokio::time::sleep;
use tracing::info;

use crate::registry::Registry;
use crate::{Error, Result};

/// Local namespace-to-VNID table maintained by the node view's NetNamespace
/// watcher. Clones share the same table.
///
/// Watchers populate the table asynchronously, so service and pod setup may
/// look a namespace up before its NetNamespace event has arrived. The
/// retrying lookup bridges that gap with a bounded polling loop that leaves
/// the lock released between probes.
#[derive(Clone)]
pub struct VnidTable {
    shared: Arc<Mutex<HashMap<String, u32>>>,
    registry: Arc<Registry>,
    retries: u32,
    retry_interval: Duration,
}

impl VnidTable {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(HashMap::new())),
            registry,
            // try a few times up to 2 seconds
            retries: 20,
            retry_interval: Duration::from_millis(100),
        }
    }

    pub fn with_retry(mut self, retries: u32, retry_interval: Duration) -> Self {
        self.retries = retries;
        self.retry_interval = retry_interval;
        self
    }

    /// Seeds the table from existing NetNamespace records so pre-existing
    /// services can resolve their VNID without waiting on the watcher.
    pub fn populate(&self) {
        for stored in self.registry.net_namespaces().list() {
            self.set(&stored.record.name, stored.record.net_id);
        }
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.shared.lock().unwrap().get(name).copied()
    }

    pub async fn get_with_retry(&self, name: &str) -> Result<u32> {
        if let Some(id) = self.get(name) {
            return Ok(id);
        }
        for _ in 0..self.retries {
            sleep(self.retry_interval).await;
            if let Some(id) = self.get(name) {
                return Ok(id);
            }
        }
        // watch propagation may be slow; read the record directly before
        // giving up
        match self.registry.get_net_namespace(name) {
            Ok(netns) => {
                self.set(name, netns.net_id);
                Ok(netns.net_id)
            }
            Err(e) if e.is_not_found() => Err(Error::Reconcile(format!(
                "no vnid found for namespace {name:?}"
            ))),
            Err(e) => Err(e),
        }
    }

    pub fn set(&self, name: &str, id: u32) {
        self.shared.lock().unwrap().insert(name.to_owned(), id);
        info!("associated vnid {id} with namespace {name:?}");
    }

    /// Removes the entry, returning the VNID it held.
    pub fn unset(&self, name: &str) -> Option<u32> {
        let id = self.shared.lock().unwrap().remove(name);
        if let Some(id) = id {
            info!("dissociated vnid {id} from namespace {name:?}");
        }
        id
    }

    /// Sorted snapshot of the table, for convergence checks.
    pub fn snapshot(&self) -> Vec<(String, u32)> {
        let mut entries: Vec<_> = self
            .shared
            .lock()
            .unwrap()
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        entries.sort();
        entries
    }
}
