//! Whole-program CFG container.
//!
//! Owns the function / block / xref arenas plus the address-based lookup
//! structures. Mutation happens in two phases: the artifact loader populates
//! the arenas, then the transformer rewires them until its fixpoint; from
//! that point on the graph is read-only and the dominator sets are solved.

use std::collections::{BTreeMap, BTreeSet};

use super::block::BasicBlock;
use super::function::FuncNode;
use super::ids::{BlockId, FuncId, XrefId};
use super::xref::StringXref;

/// Sentinel used by the post-dominator solver as the virtual exit joined to
/// every sink. Never appears in a solved set.
pub const VIRTUAL_EXIT: BlockId = BlockId(u32::MAX);

/// Binary-search lookup from an instruction address to the block that
/// contains it.
///
/// `(block -> address)` is `BasicBlock::start_addr`; this is the other
/// direction. Built once from the full block set; candidate is the block
/// with the largest `start_addr <= addr`, validated against `end_addr`.
#[derive(Debug, Clone, Default)]
pub struct AddrToBlockLookup {
    starts: Vec<u64>,
    ids: Vec<BlockId>,
}

impl AddrToBlockLookup {
    pub fn build(blocks: &[BasicBlock]) -> Self {
        let mut order: Vec<(u64, BlockId)> = blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.start_addr, BlockId(i as u32)))
            .collect();
        order.sort_by_key(|&(addr, _)| addr);
        Self {
            starts: order.iter().map(|&(addr, _)| addr).collect(),
            ids: order.iter().map(|&(_, id)| id).collect(),
        }
    }

    pub fn lookup(&self, addr: u64, blocks: &[BasicBlock]) -> Option<BlockId> {
        let idx = self.starts.partition_point(|&start| start <= addr);
        if idx == 0 {
            return None;
        }
        let id = self.ids[idx - 1];
        let block = &blocks[id.index()];
        match block.end_addr {
            Some(end) if block.start_addr <= addr && addr <= end => Some(id),
            _ => None,
        }
    }
}

/// The whole-program CFG plus the string literal table.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    pub(crate) blocks: Vec<BasicBlock>,
    pub(crate) funcs: Vec<FuncNode>,
    pub(crate) xrefs: Vec<StringXref>,
    /// Live functions by entry address.
    pub(crate) func_by_addr: BTreeMap<u64, FuncId>,
    /// Xrefs by literal bytes.
    pub(crate) xref_by_literal: BTreeMap<Vec<u8>, XrefId>,
    addr_lookup: AddrToBlockLookup,
}

impl Cfg {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Arena accessors
    // ------------------------------------------------------------------

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn func(&self, id: FuncId) -> &FuncNode {
        &self.funcs[id.index()]
    }

    pub(crate) fn func_mut(&mut self, id: FuncId) -> &mut FuncNode {
        &mut self.funcs[id.index()]
    }

    pub fn xref(&self, id: XrefId) -> &StringXref {
        &self.xrefs[id.index()]
    }

    pub(crate) fn xref_mut(&mut self, id: XrefId) -> &mut StringXref {
        &mut self.xrefs[id.index()]
    }

    // ------------------------------------------------------------------
    // Construction (artifact loader and tests)
    // ------------------------------------------------------------------

    pub fn add_func(&mut self, addr: u64) -> FuncId {
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(FuncNode::new(addr));
        self.func_by_addr.insert(addr, id);
        id
    }

    pub fn add_block(&mut self, func: FuncId, start_addr: u64, end_addr: Option<u64>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(start_addr, end_addr, func));
        self.funcs[func.index()].blocks.insert(start_addr, id);
        id
    }

    pub fn add_xref(&mut self, literal: Vec<u8>) -> XrefId {
        if let Some(&id) = self.xref_by_literal.get(&literal) {
            return id;
        }
        let id = XrefId(self.xrefs.len() as u32);
        self.xref_by_literal.insert(literal.clone(), id);
        self.xrefs.push(StringXref::new(literal));
        id
    }

    pub fn add_edge(&mut self, src: BlockId, dst: BlockId) {
        self.blocks[src.index()].succs.insert(dst);
        self.blocks[dst.index()].preds.insert(src);
    }

    pub fn add_call(&mut self, site: BlockId, callee: FuncId) {
        self.blocks[site.index()].callees.insert(callee);
        self.funcs[callee.index()].call_sites.insert(site);
    }

    pub fn attach_xref(&mut self, block: BlockId, xref: XrefId) {
        self.blocks[block.index()].xrefs.insert(xref);
        self.xrefs[xref.index()].blocks.insert(block);
    }

    /// Build the address lookup over the current block arena. Called once by
    /// the loader, before any transformation.
    pub fn finalize_lookup(&mut self) {
        self.addr_lookup = AddrToBlockLookup::build(&self.blocks);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Live functions in ascending address order.
    pub fn func_ids(&self) -> Vec<FuncId> {
        self.func_by_addr.values().copied().collect()
    }

    pub fn func_at_addr(&self, addr: u64) -> Option<FuncId> {
        self.func_by_addr.get(&addr).copied()
    }

    pub fn is_live_func(&self, id: FuncId) -> bool {
        self.func_by_addr.get(&self.funcs[id.index()].addr) == Some(&id)
    }

    pub fn remove_func(&mut self, id: FuncId) {
        self.func_by_addr.remove(&self.funcs[id.index()].addr);
    }

    /// Block containing the given instruction address, if any.
    pub fn block_at_addr(&self, addr: u64) -> Option<BlockId> {
        self.addr_lookup.lookup(addr, &self.blocks)
    }

    pub fn xref_at_literal(&self, literal: &[u8]) -> Option<XrefId> {
        self.xref_by_literal.get(literal).copied()
    }

    /// Xref ids in ascending literal order. This order fixes the pattern
    /// numbering of the matchers, so it must be deterministic.
    pub fn xref_ids(&self) -> Vec<XrefId> {
        self.xref_by_literal.values().copied().collect()
    }

    /// The entry block of a function. A live function without an entry block
    /// is a corrupt graph.
    pub fn entry_of(&self, func: FuncId) -> BlockId {
        match self.funcs[func.index()].entry() {
            Some(id) => id,
            None => panic!(
                "corrupt CFG: function {:#x} has no entry block",
                self.funcs[func.index()].addr
            ),
        }
    }

    /// Sink blocks (no successors) of a function, in address order.
    pub fn sinks_of(&self, func: FuncId) -> Vec<BlockId> {
        self.funcs[func.index()]
            .blocks
            .values()
            .copied()
            .filter(|&b| self.blocks[b.index()].is_sink())
            .collect()
    }

    /// Functions called from the live blocks of `func`.
    pub fn callees_of(&self, func: FuncId) -> BTreeSet<FuncId> {
        self.funcs[func.index()]
            .blocks
            .values()
            .flat_map(|&b| self.blocks[b.index()].callees.iter().copied())
            .collect()
    }

    pub fn num_funcs(&self) -> usize {
        self.func_by_addr.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.func_by_addr
            .values()
            .map(|&f| self.funcs[f.index()].blocks.len())
            .sum()
    }

    pub fn num_edges(&self) -> usize {
        self.func_by_addr
            .values()
            .flat_map(|&f| self.funcs[f.index()].blocks.values())
            .map(|&b| self.blocks[b.index()].succs.len())
            .sum()
    }

    /// Every block recorded as referencing a string literal. May contain
    /// stale ids mid-minimization; pruned by `update_str_xrefs`.
    pub fn string_referring_blocks(&self) -> BTreeSet<BlockId> {
        self.xrefs
            .iter()
            .flat_map(|x| x.blocks.iter().copied())
            .collect()
    }

    /// Parent functions of the string-referring blocks.
    pub fn string_referring_funcs(&self) -> BTreeSet<FuncId> {
        self.string_referring_blocks()
            .into_iter()
            .map(|b| self.blocks[b.index()].func)
            .collect()
    }

    // ------------------------------------------------------------------
    // Derived state maintenance
    // ------------------------------------------------------------------

    /// Rebuild every predecessor set of `func` from the successor sets.
    pub fn rebuild_preds(&mut self, func: FuncId) {
        let ids = self.funcs[func.index()].block_ids();
        for &b in &ids {
            self.blocks[b.index()].preds.clear();
        }
        let edges: Vec<(BlockId, Vec<BlockId>)> = ids
            .iter()
            .map(|&b| (b, self.blocks[b.index()].succs.iter().copied().collect()))
            .collect();
        for (src, succs) in edges {
            for dst in succs {
                self.blocks[dst.index()].preds.insert(src);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dominators (frozen graph only)
    // ------------------------------------------------------------------

    /// Solve dominator and post-dominator sets for every live function.
    /// Intended to run once, after minimization reached its fixpoint.
    pub fn build_dominators(&mut self) {
        for func in self.func_ids() {
            self.rebuild_preds(func);
            self.solve_dominators(func);
            self.solve_post_dominators(func);
        }
    }

    /// Naive data-flow solver. Lattice: set of blocks, join: intersection.
    ///
    /// `Dom(entry) = {entry}`;
    /// `Dom(n) = {n} ∪ ⋂ Dom(p) for p in preds(n)` otherwise.
    ///
    /// Non-entry blocks start saturated; a block with no predecessors stays
    /// saturated (unreachable blocks are not excluded).
    fn solve_dominators(&mut self, func: FuncId) {
        let ids = self.funcs[func.index()].block_ids();
        let entry = self.entry_of(func);
        let all: BTreeSet<BlockId> = ids.iter().copied().collect();

        for &b in &ids {
            self.blocks[b.index()].doms = if b == entry {
                BTreeSet::from([b])
            } else {
                all.clone()
            };
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &b in &ids {
                if b == entry {
                    continue;
                }
                let preds: Vec<BlockId> = self.blocks[b.index()].preds.iter().copied().collect();
                let Some((&first, rest)) = preds.split_first() else {
                    continue;
                };
                let mut new_doms = self.blocks[first.index()].doms.clone();
                for &p in rest {
                    let pd = &self.blocks[p.index()].doms;
                    new_doms.retain(|x| pd.contains(x));
                }
                new_doms.insert(b);
                if new_doms != self.blocks[b.index()].doms {
                    self.blocks[b.index()].doms = new_doms;
                    changed = true;
                }
            }
        }
    }

    /// Post-dominator solver, symmetric to `solve_dominators` with a virtual
    /// exit joined to every sink. The virtual node is stripped from the
    /// results. Admits multiple sinks; does not require full reachability.
    fn solve_post_dominators(&mut self, func: FuncId) {
        let ids = self.funcs[func.index()].block_ids();
        let sinks: BTreeSet<BlockId> = ids
            .iter()
            .copied()
            .filter(|&b| self.blocks[b.index()].is_sink())
            .collect();
        let all: BTreeSet<BlockId> = ids.iter().copied().collect();

        for &b in &ids {
            self.blocks[b.index()].pdoms = if sinks.contains(&b) {
                BTreeSet::from([b, VIRTUAL_EXIT])
            } else {
                all.clone()
            };
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &b in &ids {
                if sinks.contains(&b) {
                    continue;
                }
                let succs: Vec<BlockId> = self.blocks[b.index()].succs.iter().copied().collect();
                let Some((&first, rest)) = succs.split_first() else {
                    continue;
                };
                let mut new_pdoms = self.blocks[first.index()].pdoms.clone();
                for &s in rest {
                    let sp = &self.blocks[s.index()].pdoms;
                    new_pdoms.retain(|x| sp.contains(x));
                }
                new_pdoms.insert(b);
                if new_pdoms != self.blocks[b.index()].pdoms {
                    self.blocks[b.index()].pdoms = new_pdoms;
                    changed = true;
                }
            }
        }

        for &b in &ids {
            self.blocks[b.index()].pdoms.remove(&VIRTUAL_EXIT);
        }
    }
}
