use crate::data::QosError;
use slog::{Logger, error, warn};
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Hands out queue / meter ids from `[start_idx, max_idx)`.  Released ids are reused in
/// release order before the counter advances.
pub struct IdManager {
    start_idx: u32,
    max_idx: u32,
    counter: u32,
    free: VecDeque<u32>,
    allocated: HashSet<u32>,
    restored: bool,
    logger: Logger,
}

impl IdManager {
    pub fn new(start_idx: u32, max_idx: u32, logger: &Logger) -> Self {
        IdManager {
            start_idx,
            max_idx,
            counter: start_idx,
            free: VecDeque::new(),
            allocated: HashSet::new(),
            restored: false,
            logger: logger.clone(),
        }
    }

    pub fn allocate(&mut self) -> Result<u32, QosError> {
        let id = if let Some(id) = self.free.pop_front() {
            id
        } else if self.counter < self.max_idx {
            self.counter += 1;
            self.counter - 1
        } else {
            return Err(QosError::MaxIdAllocationExceeded);
        };
        self.allocated.insert(id);
        Ok(id)
    }

    /// Releasing an id that is not currently allocated is logged and ignored, so a double
    /// release can never put the same id on the free list twice.
    pub fn release(&mut self, id: u32) {
        if id < self.start_idx || id >= self.counter || !self.allocated.remove(&id) {
            error!(self.logger, "attempting to release invalid idx {id}");
            return;
        }
        self.free.push_back(id);
    }

    /// Resume after a restart with `ids` still programmed.  Every id below the highest one
    /// that is not in use goes on the free list.  Only the first call has any effect.
    pub fn restore_state(&mut self, ids: &[u32]) {
        if self.restored {
            return;
        }
        self.restored = true;
        let mut in_use = BTreeSet::new();
        for id in ids.iter() {
            if *id < self.start_idx || *id >= self.max_idx {
                warn!(self.logger, "Ignoring out of range idx {id} on restore");
                continue;
            }
            in_use.insert(*id);
        }
        let Some(highest) = in_use.last() else {
            return;
        };
        self.counter = highest + 1;
        self.free = (self.start_idx..self.counter)
            .filter(|id| !in_use.contains(id))
            .collect();
        self.allocated = in_use.into_iter().collect();
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}
