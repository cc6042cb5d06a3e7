use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use ahash::{HashSet, HashSetExt};
use ipnetwork::Ipv4Network;
use tracing::warn;

use crate::{Error, Result};

/// Carves a cluster network into fixed-size node subnets and tracks which of
/// them are in use. All operations are atomic; clones share the same pool.
///
/// Allocation order is deterministic: the lowest previously released slot is
/// reused first, otherwise the cursor hands out the next untouched slot.
#[derive(Clone)]
pub struct SubnetAllocator {
    shared: Arc<Mutex<State>>,
}

struct State {
    network: Ipv4Network,
    subnet_prefix: u8,
    capacity: u32,
    allocated: HashSet<u32>,
    released: BTreeSet<u32>,
    next: u32,
}

impl SubnetAllocator {
    /// `in_use` subnets that are no longer part of the cluster network (for
    /// example after a network reconfiguration) are skipped with a warning;
    /// startup cross-validation has already reported them.
    pub fn new(
        network: Ipv4Network,
        host_subnet_bits: u32,
        in_use: &[Ipv4Network],
    ) -> Result<Self> {
        let prefix = u32::from(network.prefix()) + host_subnet_bits;
        if host_subnet_bits == 0 || prefix > 30 {
            return Err(Error::InvalidNetworkConfig(format!(
                "cannot split {network} into subnets of {host_subnet_bits} extra bits"
            )));
        }

        let mut state = State {
            network,
            subnet_prefix: prefix as u8,
            capacity: 1 << host_subnet_bits,
            allocated: HashSet::new(),
            released: BTreeSet::new(),
            next: 0,
        };
        for subnet in in_use {
            match state.index_of(subnet) {
                Some(index) => {
                    state.allocated.insert(index);
                }
                None => warn!(
                    "subnet {} is not a /{} subnet of cluster network {}, skipping",
                    subnet, state.subnet_prefix, network
                ),
            }
        }

        Ok(Self {
            shared: Arc::new(Mutex::new(state)),
        })
    }

    pub fn allocate(&self) -> Result<Ipv4Network> {
        let mut state = self.shared.lock().unwrap();
        if let Some(index) = state.released.pop_first() {
            state.allocated.insert(index);
            return state.subnet_at(index);
        }
        while state.next < state.capacity {
            let index = state.next;
            state.next += 1;
            if state.allocated.contains(&index) {
                continue;
            }
            state.allocated.insert(index);
            return state.subnet_at(index);
        }
        Err(Error::Exhausted("subnet"))
    }

    /// Returns a previously allocated subnet to the pool. Releasing a subnet
    /// that is not currently allocated is a no-op; releasing one that is not
    /// a node subnet of the cluster network is an error.
    pub fn release(&self, subnet: Ipv4Network) -> Result<()> {
        let mut state = self.shared.lock().unwrap();
        let Some(index) = state.index_of(&subnet) else {
            return Err(Error::InvalidSubnet(format!(
                "{} is not a /{} subnet of cluster network {}",
                subnet, state.subnet_prefix, state.network
            )));
        };
        if state.allocated.remove(&index) {
            state.released.insert(index);
        }
        Ok(())
    }

    /// Whether the subnet is currently allocated.
    pub fn contains(&self, subnet: Ipv4Network) -> bool {
        let state = self.shared.lock().unwrap();
        state
            .index_of(&subnet)
            .is_some_and(|index| state.allocated.contains(&index))
    }

    pub fn free(&self) -> u32 {
        let state = self.shared.lock().unwrap();
        state.capacity - state.allocated.len() as u32
    }
}

impl State {
    fn index_of(&self, subnet: &Ipv4Network) -> Option<u32> {
        if subnet.prefix() != self.subnet_prefix || !self.network.contains(subnet.network()) {
            return None;
        }
        let base = u32::from(self.network.network());
        Some((u32::from(subnet.network()) - base) >> (32 - u32::from(self.subnet_prefix)))
    }

    fn subnet_at(&self, index: u32) -> Result<Ipv4Network> {
        let base = u32::from(self.network.network());
        let addr = base + (index << (32 - u32::from(self.subnet_prefix)));
        Ok(Ipv4Network::new(Ipv4Addr::from(addr), self.subnet_prefix)?)
    }
}
