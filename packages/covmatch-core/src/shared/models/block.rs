//! Basic block node.

use std::collections::{BTreeMap, BTreeSet};

use super::ids::{BlockId, FuncId, XrefId};

/// A basic block of the recovered CFG.
///
/// Identity is the arena id, which is in bijection with `start_addr`.
/// `preds` is derived state; it is rebuilt from `succs` at pass boundaries
/// (`Cfg::rebuild_preds`) and must not be trusted in between.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Address of the first instruction; unique identifier of the block.
    pub start_addr: u64,
    /// Address of the last instruction.
    pub end_addr: Option<u64>,

    /// Successor blocks. After inlining stabilizes these are always within
    /// the same function.
    pub succs: BTreeSet<BlockId>,
    /// Predecessor blocks (derived from `succs`; periodically rebuilt).
    pub preds: BTreeSet<BlockId>,

    /// Function this block currently belongs to. Rewritten by the inliner.
    pub func: FuncId,

    /// String literals referenced by instructions inside this block.
    pub xrefs: BTreeSet<XrefId>,
    /// Functions called from this block.
    pub callees: BTreeSet<FuncId>,

    /// Traversing the minimized-graph edge `self -> succ` implies that the
    /// original execution passed through every block in the mapped set.
    /// Invariant: a non-empty entry requires `succ ∈ succs`.
    pub edge_implicates: BTreeMap<BlockId, BTreeSet<BlockId>>,

    /// Dominators; populated once on the frozen post-minimization graph.
    pub doms: BTreeSet<BlockId>,
    /// Post-dominators; same lifecycle as `doms`.
    pub pdoms: BTreeSet<BlockId>,
}

impl BasicBlock {
    pub fn new(start_addr: u64, end_addr: Option<u64>, func: FuncId) -> Self {
        Self {
            start_addr,
            end_addr,
            succs: BTreeSet::new(),
            preds: BTreeSet::new(),
            func,
            xrefs: BTreeSet::new(),
            callees: BTreeSet::new(),
            edge_implicates: BTreeMap::new(),
            doms: BTreeSet::new(),
            pdoms: BTreeSet::new(),
        }
    }

    /// A block with no successors is a sink.
    pub fn is_sink(&self) -> bool {
        self.succs.is_empty()
    }

    /// Implication set recorded on the edge `self -> succ`, cloned.
    /// Absent entries are empty sets.
    pub fn implicates(&self, succ: BlockId) -> BTreeSet<BlockId> {
        self.edge_implicates.get(&succ).cloned().unwrap_or_default()
    }
}
