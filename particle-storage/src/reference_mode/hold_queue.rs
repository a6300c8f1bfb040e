//! Outbound sends parked until the backing store catches up.
//!
//! Each block waits on a set of entity ids, each with a minimum version.
//! When the backing store reports a version for an id, every block whose
//! requirement for that id is met drops it; a block with nothing left is
//! released.

use std::collections::{BTreeMap, HashSet};

use particle_crdt::{ReferenceId, VersionMap};

pub type BlockId = u64;

#[derive(Debug)]
struct HoldRecord {
    block: BlockId,
    remaining: BTreeMap<ReferenceId, VersionMap>,
}

#[derive(Debug, Default)]
pub struct HoldQueue {
    records: Vec<HoldRecord>,
    next_block: BlockId,
    released: HashSet<BlockId>,
}

impl HoldQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until every `(id, version)` requirement is met.
    pub fn enqueue(&mut self, requirements: BTreeMap<ReferenceId, VersionMap>) -> BlockId {
        self.next_block += 1;
        let block = self.next_block;
        if requirements.is_empty() {
            self.released.insert(block);
        } else {
            self.records.push(HoldRecord { block, remaining: requirements });
        }
        block
    }

    /// The backing store now holds `id` at `version`. Returns how many
    /// blocks were released.
    pub fn process(&mut self, id: &str, version: &VersionMap) -> usize {
        let mut released = 0;
        self.records.retain_mut(|record| {
            if record.remaining.get(id).is_some_and(|required| version.dominates(required)) {
                record.remaining.remove(id);
            }
            if record.remaining.is_empty() {
                self.released.insert(record.block);
                released += 1;
                false
            } else {
                true
            }
        });
        released
    }

    pub fn is_released(&self, block: BlockId) -> bool {
        self.released.contains(&block)
    }

    /// Forget a released block once its send went out.
    pub fn retire(&mut self, block: BlockId) {
        self.released.remove(&block);
    }

    /// Ids some block is still waiting on.
    pub fn waiting_ids(&self) -> HashSet<ReferenceId> {
        self.records.iter().flat_map(|r| r.remaining.keys().cloned()).collect()
    }

    pub fn blocked_count(&self) -> usize {
        self.records.len()
    }
}
