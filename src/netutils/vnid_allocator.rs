use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use ahash::{HashSet, HashSetExt};

use crate::{Error, Result, netid};

/// Allocates VXLAN network identifiers from a bounded range. The global VNID
/// (0) is never handed out nor released here. All operations are atomic;
/// clones share the same pool.
#[derive(Clone)]
pub struct VnidAllocator {
    shared: Arc<Mutex<State>>,
}

struct State {
    min: u32,
    max: u32,
    allocated: HashSet<u32>,
    released: BTreeSet<u32>,
    next: u32,
}

impl VnidAllocator {
    pub fn new(min: u32, max: u32, in_use: &[u32]) -> Result<Self> {
        if min < netid::MIN_VNID || min > max || max > netid::MAX_VNID {
            return Err(Error::InvalidVnid(format!(
                "invalid vnid range [{min}, {max}]"
            )));
        }
        let mut allocated = HashSet::new();
        for &id in in_use {
            if id < min || id > max {
                return Err(Error::InvalidVnid(format!(
                    "vnid {id} is outside the range [{min}, {max}]"
                )));
            }
            allocated.insert(id);
        }
        Ok(Self {
            shared: Arc::new(Mutex::new(State {
                min,
                max,
                allocated,
                released: BTreeSet::new(),
                next: min,
            })),
        })
    }

    pub fn allocate(&self) -> Result<u32> {
        let mut state = self.shared.lock().unwrap();
        if let Some(id) = state.released.pop_first() {
            state.allocated.insert(id);
            return Ok(id);
        }
        while state.next <= state.max {
            let id = state.next;
            state.next += 1;
            if state.allocated.contains(&id) {
                continue;
            }
            state.allocated.insert(id);
            return Ok(id);
        }
        Err(Error::Exhausted("vnid"))
    }

    /// Releasing a VNID that is not currently allocated is a no-op;
    /// releasing one outside the allocator's range is an error.
    pub fn release(&self, id: u32) -> Result<()> {
        let mut state = self.shared.lock().unwrap();
        if id < state.min || id > state.max {
            return Err(Error::InvalidVnid(format!(
                "vnid {id} is outside the range [{}, {}]",
                state.min, state.max
            )));
        }
        if state.allocated.remove(&id) {
            state.released.insert(id);
        }
        Ok(())
    }

    pub fn has(&self, id: u32) -> bool {
        self.shared.lock().unwrap().allocated.contains(&id)
    }
}
