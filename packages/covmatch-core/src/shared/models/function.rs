//! Function node.

use std::collections::{BTreeMap, BTreeSet};

use super::ids::BlockId;

/// A function of the recovered CFG, identified by its entry address.
#[derive(Debug, Clone, Default)]
pub struct FuncNode {
    /// Entry address of this function.
    pub addr: u64,
    /// Live blocks owned by this function, keyed by start address.
    /// Removal from this map is what "deleting" a block means; the arena
    /// slot itself is never reused.
    pub blocks: BTreeMap<u64, BlockId>,
    /// Blocks (in any function) that contain a call to this function.
    pub call_sites: BTreeSet<BlockId>,
}

impl FuncNode {
    pub fn new(addr: u64) -> Self {
        Self {
            addr,
            blocks: BTreeMap::new(),
            call_sites: BTreeSet::new(),
        }
    }

    /// The entry block, i.e. the block whose start address equals the
    /// function address. `None` only on a corrupt graph.
    pub fn entry(&self) -> Option<BlockId> {
        self.blocks.get(&self.addr).copied()
    }

    /// Live block ids in ascending address order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.values().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
