//! CFG minimization.
//!
//! Three semantics-weakening passes cycle until a fixpoint:
//!
//! 1. function inlining (single-call-site interesting callees),
//! 2. uninteresting-node removal,
//! 3. automata-style merging of behaviorally indistinguishable blocks.
//!
//! Every removal records the absorbed blocks as implication metadata on the
//! surviving edges: traversing a minimized edge implies the original
//! execution passed through every block in its implication set. Merging
//! records nothing (behaviorally identical blocks are interchangeable
//! execution witnesses).

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::features::call_graph::CallGraph;
use crate::shared::models::{BlockId, Cfg, FuncId, XrefId};

/// Driver for the minimization passes.
///
/// All transformations are deterministic and total. Invariant violations
/// caught by the verification hooks are programming errors and abort.
pub struct CfgTransformer {
    call_graph: Option<CallGraph>,
    operation_count: usize,
}

impl Default for CfgTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl CfgTransformer {
    pub fn new() -> Self {
        Self {
            call_graph: None,
            operation_count: 0,
        }
    }

    // ------------------------------------------------------------------
    // Call graph bookkeeping
    // ------------------------------------------------------------------

    fn rebuild_call_graph(&mut self, cfg: &Cfg) {
        let seeds: Vec<FuncId> = cfg
            .string_referring_funcs()
            .into_iter()
            .filter(|&f| cfg.is_live_func(f))
            .collect();
        self.call_graph = Some(CallGraph::build(cfg, &seeds));
    }

    /// The call graph over interesting functions, built lazily.
    pub fn call_graph(&mut self, cfg: &Cfg) -> &CallGraph {
        if self.call_graph.is_none() {
            self.rebuild_call_graph(cfg);
        }
        self.call_graph.as_ref().expect("call graph just built")
    }

    /// Interesting functions (call-graph members), ascending by id.
    fn interesting_funcs(&mut self, cfg: &Cfg) -> Vec<FuncId> {
        let mut funcs = self.call_graph(cfg).funcs();
        funcs.sort();
        funcs
    }

    /// Blocks that call an interesting function.
    fn string_calling_blocks(
        cfg: &Cfg,
        interesting: &FxHashSet<FuncId>,
    ) -> BTreeSet<BlockId> {
        let mut result = BTreeSet::new();
        for &caller in interesting {
            if !cfg.is_live_func(caller) {
                continue;
            }
            for bb in cfg.func(caller).block_ids() {
                if cfg
                    .block(bb)
                    .callees
                    .iter()
                    .any(|c| interesting.contains(c))
                {
                    result.insert(bb);
                }
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // Pass 1: function inlining
    // ------------------------------------------------------------------

    /// Inline a callee into a specific call site.
    ///
    /// Sinks of the callee inherit the call site's successors and edge
    /// implications; the call site's only successor becomes the callee
    /// entry; every callee block is re-parented into the caller.
    fn inline_callee(&mut self, cfg: &mut Cfg, call_site: BlockId, callee: FuncId) {
        debug_assert!(cfg.block(call_site).callees.contains(&callee));
        let caller = cfg.block(call_site).func;
        let sinks = cfg.sinks_of(callee);
        let cs_succs = cfg.block(call_site).succs.clone();
        let cs_implicates = cfg.block(call_site).edge_implicates.clone();

        for sink in sinks {
            let block = cfg.block_mut(sink);
            block.succs = cs_succs.clone();
            block.edge_implicates = cs_implicates.clone();
        }

        let entry = cfg.entry_of(callee);
        {
            let block = cfg.block_mut(call_site);
            block.edge_implicates.clear();
            block.succs = BTreeSet::from([entry]);
        }

        let moved: Vec<(u64, BlockId)> = cfg
            .func(callee)
            .blocks
            .iter()
            .map(|(&addr, &b)| (addr, b))
            .collect();
        for (addr, b) in moved {
            cfg.block_mut(b).func = caller;
            cfg.func_mut(caller).blocks.insert(addr, b);
        }
        cfg.func_mut(callee).blocks.clear();
        self.operation_count += 1;
    }

    fn inline_function_callees(
        &mut self,
        cfg: &mut Cfg,
        caller: FuncId,
        interesting: &FxHashSet<FuncId>,
        removed: &mut Vec<FuncId>,
        same_scc: &[FuncId],
    ) -> bool {
        let mut changed = false;
        for bb in cfg.func(caller).block_ids() {
            let callees: Vec<FuncId> = cfg.block(bb).callees.iter().copied().collect();
            for callee in callees {
                if interesting.contains(&callee)
                    && cfg.func(callee).call_sites.len() == 1
                    && !same_scc.contains(&callee)
                {
                    debug!(
                        op = self.operation_count,
                        "inlining {:#x} into {:#x}",
                        cfg.func(callee).addr,
                        cfg.func(caller).addr
                    );
                    self.inline_callee(cfg, bb, callee);
                    removed.push(callee);
                    cfg.block_mut(bb).callees.remove(&callee);
                    changed = true;
                    if cfg!(debug_assertions) {
                        self.verify_func(cfg, caller);
                    }
                }
            }
        }
        changed
    }

    /// Visit functions callees-first and inline every interesting callee
    /// with exactly one call site outside its own SCC.
    pub fn run_inliner_pass(&mut self, cfg: &mut Cfg) -> bool {
        let (order, scc_of, members) = {
            let cg = self.call_graph(cfg);
            let order = cg.bottom_up_order();
            let scc_of: FxHashMap<FuncId, usize> =
                order.iter().map(|&f| (f, cg.scc_of(f))).collect();
            let members: Vec<Vec<FuncId>> = (0..cg.scc_count())
                .map(|s| cg.scc_members(s).to_vec())
                .collect();
            (order, scc_of, members)
        };
        let interesting: FxHashSet<FuncId> = order.iter().copied().collect();

        let mut removed: Vec<FuncId> = Vec::new();
        for caller in order {
            assert!(
                !cfg.func(caller).is_empty(),
                "function {:#x} is not visited in bottom-up order",
                cfg.func(caller).addr
            );
            let same_scc = &members[scc_of[&caller]];
            self.inline_function_callees(cfg, caller, &interesting, &mut removed, same_scc);
        }

        if removed.is_empty() {
            return false;
        }
        for func in removed {
            cfg.remove_func(func);
        }
        self.rebuild_call_graph(cfg);
        true
    }

    // ------------------------------------------------------------------
    // Pass 2: uninteresting-node removal
    // ------------------------------------------------------------------

    /// Splice a block out of its function, connecting every predecessor to
    /// every successor and folding the block into the edge implications.
    fn remove_node(&mut self, cfg: &mut Cfg, func: FuncId, bb: BlockId) {
        debug!(
            op = self.operation_count,
            "removing node {:#x} from {:#x}",
            cfg.block(bb).start_addr,
            cfg.func(func).addr
        );
        let preds: Vec<BlockId> = cfg.block(bb).preds.iter().copied().collect();
        let succs: Vec<BlockId> = cfg.block(bb).succs.iter().copied().collect();

        for &p in &preds {
            for &s in &succs {
                // (bb -> bb -> s) and (p -> bb -> bb) need no new edge, and
                // the implication of the surviving edge stays valid.
                if p == bb || s == bb {
                    continue;
                }
                // Graph is (p -> bb -> s); does (p -> s) exist already?
                let overlap = cfg.block(p).succs.contains(&s);
                cfg.block_mut(p).succs.insert(s);
                cfg.block_mut(s).preds.insert(p);

                // The new edge implicates whatever (p -> bb) and (bb -> s)
                // implicated, plus bb itself.
                let mut implicated = cfg.block(p).implicates(bb);
                implicated.extend(cfg.block(bb).implicates(s));
                implicated.insert(bb);

                if overlap {
                    // Merging parallel paths: only blocks implied by every
                    // path survive, so the sets intersect.
                    if let Some(existing) = cfg.block_mut(p).edge_implicates.get_mut(&s) {
                        existing.retain(|x| implicated.contains(x));
                    }
                } else {
                    debug_assert!(
                        cfg.block(p).implicates(s).is_empty(),
                        "(p -> s) must not carry implications before bb removal"
                    );
                    cfg.block_mut(p).edge_implicates.insert(s, implicated);
                }
            }
        }

        cfg.rebuild_preds(func);
        for &p in &preds {
            cfg.block_mut(p).succs.remove(&bb);
            cfg.block_mut(p).edge_implicates.remove(&bb);
        }
        for &s in &succs {
            cfg.block_mut(s).preds.remove(&bb);
        }
        {
            let block = cfg.block_mut(bb);
            block.preds.clear();
            block.succs.clear();
        }
        let addr = cfg.block(bb).start_addr;
        cfg.func_mut(func).blocks.remove(&addr);
        if cfg!(debug_assertions) {
            self.verify_func(cfg, func);
        }
        self.operation_count += 1;
    }

    fn remove_non_interesting_nodes(
        &mut self,
        cfg: &mut Cfg,
        func: FuncId,
        saved: &BTreeSet<BlockId>,
    ) {
        let entry = cfg.entry_of(func);
        // Entry anchors the analysis; sinks anchor the post-dominators.
        let to_remove: Vec<BlockId> = cfg
            .func(func)
            .block_ids()
            .into_iter()
            .filter(|&b| !saved.contains(&b) && b != entry && !cfg.block(b).is_sink())
            .collect();
        for bb in to_remove {
            self.remove_node(cfg, func, bb);
        }
    }

    /// Redirect an edge `bb -> entry` to every successor of the entry block
    /// (dropping entry self-loops). The implication set of the removed edge
    /// is propagated to each redirected edge from one snapshot: intersected
    /// if the edge pre-existed, copied otherwise.
    fn remove_entry_incoming_edge(&mut self, cfg: &mut Cfg, bb: BlockId, entry: BlockId) {
        debug!(
            op = self.operation_count,
            "redirecting entry in-edge {:#x} -> {:#x}",
            cfg.block(bb).start_addr,
            cfg.block(entry).start_addr
        );
        assert!(
            cfg.block(bb).succs.contains(&entry),
            "edge {:#x} -> {:#x} does not exist",
            cfg.block(bb).start_addr,
            cfg.block(entry).start_addr
        );
        cfg.block_mut(bb).succs.remove(&entry);
        let entry_implicates = cfg.block(bb).implicates(entry);
        let entry_succs: Vec<BlockId> = cfg.block(entry).succs.iter().copied().collect();
        for s in entry_succs {
            if s == entry {
                continue;
            }
            let overlap = cfg.block(bb).succs.contains(&s);
            cfg.block_mut(bb).succs.insert(s);
            if overlap {
                if let Some(existing) = cfg.block_mut(bb).edge_implicates.get_mut(&s) {
                    existing.retain(|x| entry_implicates.contains(x));
                }
            } else {
                cfg.block_mut(bb)
                    .edge_implicates
                    .insert(s, entry_implicates.clone());
            }
        }
        cfg.block_mut(bb).edge_implicates.remove(&entry);
        if cfg!(debug_assertions) {
            self.verify_block(cfg, bb);
        }
        self.operation_count += 1;
    }

    fn remove_entry_incomings(&mut self, cfg: &mut Cfg, func: FuncId) {
        let entry = cfg.entry_of(func);
        for bb in cfg.func(func).block_ids() {
            if cfg.block(bb).succs.contains(&entry) {
                self.remove_entry_incoming_edge(cfg, bb, entry);
            }
        }
    }

    fn minimize_function(&mut self, cfg: &mut Cfg, func: FuncId, saved: &BTreeSet<BlockId>) {
        cfg.rebuild_preds(func);
        self.remove_non_interesting_nodes(cfg, func, saved);
        self.remove_entry_incomings(cfg, func);
    }

    /// Remove every block that neither references a literal nor calls an
    /// interesting function, preserving entries and sinks.
    pub fn run_node_remove_pass(&mut self, cfg: &mut Cfg) -> bool {
        let funcs = self.interesting_funcs(cfg);
        let interesting: FxHashSet<FuncId> = funcs.iter().copied().collect();
        let mut saved = cfg.string_referring_blocks();
        saved.extend(Self::string_calling_blocks(cfg, &interesting));

        let mut changed = false;
        for func in funcs {
            let before = cfg.func(func).blocks.len();
            self.minimize_function(cfg, func, &saved);
            let after = cfg.func(func).blocks.len();
            assert!(before >= after);
            changed |= before != after;
        }
        changed
    }

    // ------------------------------------------------------------------
    // Pass 3: automata-style merging
    // ------------------------------------------------------------------

    /// Merge each block of `merged` into `survivor`.
    ///
    /// Unlike node removal this does not add the merged blocks to any
    /// implication set: the blocks behave identically, and only one of them
    /// can have executed.
    fn merge_blocks(
        &mut self,
        cfg: &mut Cfg,
        func: FuncId,
        merged: &[BlockId],
        survivor: BlockId,
        interesting: &FxHashSet<FuncId>,
    ) {
        debug_assert!(!merged.contains(&survivor));
        for &bb in merged {
            let preds: Vec<BlockId> = cfg.block(bb).preds.iter().copied().collect();
            for p in preds {
                if p == bb {
                    continue;
                }
                let overlap = cfg.block(p).succs.contains(&survivor);
                cfg.block_mut(p).succs.remove(&bb);
                cfg.block_mut(p).succs.insert(survivor);
                cfg.block_mut(survivor).preds.insert(p);
                cfg.block_mut(bb).preds.remove(&p);

                let implicated = cfg.block(p).implicates(bb);
                if overlap {
                    if let Some(existing) = cfg.block_mut(p).edge_implicates.get_mut(&survivor) {
                        existing.retain(|x| implicated.contains(x));
                    }
                } else if !implicated.is_empty() {
                    cfg.block_mut(p).edge_implicates.insert(survivor, implicated);
                }
                cfg.block_mut(p).edge_implicates.remove(&bb);
            }

            let succs: Vec<BlockId> = cfg.block(bb).succs.iter().copied().collect();
            for s in succs {
                if s == bb {
                    continue;
                }
                let overlap = cfg.block(survivor).succs.contains(&s);
                cfg.block_mut(s).preds.remove(&bb);
                cfg.block_mut(s).preds.insert(survivor);
                cfg.block_mut(survivor).succs.insert(s);
                cfg.block_mut(bb).succs.remove(&s);

                let implicated = cfg.block(bb).implicates(s);
                if overlap {
                    if let Some(existing) = cfg.block_mut(survivor).edge_implicates.get_mut(&s) {
                        existing.retain(|x| implicated.contains(x));
                    }
                } else if !implicated.is_empty() {
                    cfg.block_mut(survivor).edge_implicates.insert(s, implicated);
                }
                cfg.block_mut(bb).edge_implicates.remove(&s);
            }
        }

        for &bb in merged {
            let callees: Vec<FuncId> = cfg.block(bb).callees.iter().copied().collect();
            for callee in callees {
                if interesting.contains(&callee) {
                    cfg.func_mut(callee).call_sites.remove(&bb);
                }
            }
            let addr = cfg.block(bb).start_addr;
            cfg.func_mut(func).blocks.remove(&addr);
        }
        if cfg!(debug_assertions) {
            self.verify_func(cfg, func);
        }
        self.operation_count += 1;
    }

    /// Partition refinement over one function.
    ///
    /// Initial classes are the observable behavior pairs
    /// `(literals, callees ∩ interesting)`; refinement keeps two blocks
    /// together iff their successor sets project onto equal class-id sets.
    fn merge_duplicate_nodes(
        &mut self,
        cfg: &mut Cfg,
        func: FuncId,
        interesting: &FxHashSet<FuncId>,
    ) -> bool {
        cfg.rebuild_preds(func);

        let mut behavior_classes: BTreeMap<(BTreeSet<XrefId>, BTreeSet<FuncId>), Vec<BlockId>> =
            BTreeMap::new();
        for bb in cfg.func(func).block_ids() {
            let literals = cfg.block(bb).xrefs.clone();
            let callees: BTreeSet<FuncId> = cfg
                .block(bb)
                .callees
                .iter()
                .copied()
                .filter(|c| interesting.contains(c))
                .collect();
            behavior_classes
                .entry((literals, callees))
                .or_default()
                .push(bb);
        }

        let mut segments: Vec<Vec<BlockId>> = behavior_classes.into_values().collect();
        let mut seg_of: FxHashMap<BlockId, usize> = FxHashMap::default();
        for (id, seg) in segments.iter().enumerate() {
            for &bb in seg {
                seg_of.insert(bb, id);
            }
        }

        loop {
            let mut converged = true;
            let mut new_segments: Vec<Vec<BlockId>> = Vec::new();
            let mut new_seg_of: FxHashMap<BlockId, usize> = FxHashMap::default();
            for seg in &segments {
                if seg.len() == 1 {
                    new_seg_of.insert(seg[0], new_segments.len());
                    new_segments.push(seg.clone());
                    continue;
                }
                let mut splits: BTreeMap<BTreeSet<usize>, Vec<BlockId>> = BTreeMap::new();
                for &bb in seg {
                    let key: BTreeSet<usize> = cfg
                        .block(bb)
                        .succs
                        .iter()
                        .map(|s| seg_of[s])
                        .collect();
                    splits.entry(key).or_default().push(bb);
                }
                if splits.len() > 1 {
                    converged = false;
                }
                for (_, members) in splits {
                    let id = new_segments.len();
                    for &bb in &members {
                        new_seg_of.insert(bb, id);
                    }
                    new_segments.push(members);
                }
            }
            seg_of = new_seg_of;
            segments = new_segments;
            if converged {
                break;
            }
        }

        let mut changed = false;
        for seg in segments {
            if seg.len() == 1 {
                continue;
            }
            changed = true;
            let survivor = seg[0];
            debug!(
                op = self.operation_count,
                "merging {} blocks into {:#x}",
                seg.len() - 1,
                cfg.block(survivor).start_addr
            );
            self.merge_blocks(cfg, func, &seg[1..], survivor, interesting);
        }
        changed
    }

    /// Merge indistinguishable blocks in every interesting function.
    pub fn run_node_merge_pass(&mut self, cfg: &mut Cfg) -> bool {
        let funcs = self.interesting_funcs(cfg);
        let interesting: FxHashSet<FuncId> = funcs.iter().copied().collect();
        let mut changed = false;
        for func in funcs {
            changed |= self.merge_duplicate_nodes(cfg, func, &interesting);
        }
        changed
    }

    // ------------------------------------------------------------------
    // Fixpoint driver
    // ------------------------------------------------------------------

    /// Intersect every xref's block set with the live blocks of the
    /// interesting functions.
    pub fn update_str_xrefs(&mut self, cfg: &mut Cfg) {
        let mut live: BTreeSet<BlockId> = BTreeSet::new();
        for func in self.interesting_funcs(cfg) {
            live.extend(cfg.func(func).block_ids());
        }
        for xref in cfg.xref_ids() {
            let pruned: BTreeSet<BlockId> = cfg
                .xref(xref)
                .blocks
                .intersection(&live)
                .copied()
                .collect();
            cfg.xref_mut(xref).blocks = pruned;
        }
    }

    /// Drop every live function that is not part of the call graph.
    pub fn remove_unrelated_funcs(&mut self, cfg: &mut Cfg) {
        let keep: FxHashSet<FuncId> = self.interesting_funcs(cfg).into_iter().collect();
        for func in cfg.func_ids() {
            if !keep.contains(&func) {
                cfg.remove_func(func);
            }
        }
    }

    /// Cycle {inliner, remover, merger} to a fixpoint, then refresh the
    /// xref back-references and sweep dead functions.
    pub fn run_all_passes(&mut self, cfg: &mut Cfg) {
        self.run_passes_capped(cfg, usize::MAX);
    }

    /// Fixpoint driver with a cycle cap. Debugging aid; `run_all_passes` is
    /// the uncapped form.
    pub fn run_passes_capped(&mut self, cfg: &mut Cfg, max_cycles: usize) {
        self.remove_unrelated_funcs(cfg);
        let mut changed = true;
        let mut cycle = 0usize;
        while changed && cycle < max_cycles {
            debug!(cycle, "running minimization cycle");
            cycle += 1;
            changed = false;
            changed |= self.run_inliner_pass(cfg);
            self.verify_cfg(cfg);
            changed |= self.run_node_remove_pass(cfg);
            self.verify_cfg(cfg);
            changed |= self.run_node_merge_pass(cfg);
            self.verify_cfg(cfg);
            debug!(cycle, changed, "finished minimization cycle");
        }
        self.update_str_xrefs(cfg);
        self.remove_unrelated_funcs(cfg);
    }

    pub fn operation_count(&self) -> usize {
        self.operation_count
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    /// Every non-empty implication entry must sit on an existing edge.
    pub fn verify_block(&self, cfg: &Cfg, bb: BlockId) {
        let block = cfg.block(bb);
        for (&succ, implicated) in &block.edge_implicates {
            if implicated.is_empty() {
                continue;
            }
            assert!(
                block.succs.contains(&succ),
                "corrupt CFG: implicated edge {:#x} -> {:#x} does not exist",
                block.start_addr,
                cfg.block(succ).start_addr
            );
        }
    }

    pub fn verify_func(&self, cfg: &Cfg, func: FuncId) {
        for bb in cfg.func(func).block_ids() {
            self.verify_block(cfg, bb);
        }
    }

    pub fn verify_cfg(&self, cfg: &Cfg) {
        for func in cfg.func_ids() {
            self.verify_func(cfg, func);
        }
    }
}
