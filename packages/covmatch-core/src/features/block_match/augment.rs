//! Coverage augmentation.
//!
//! Closures over an inferred block set against the frozen minimized graph.
//! The dominator closure is always sound; the must-pass closure only reads
//! implications from single-pred/single-succ blocks; the aggressive closure
//! treats any edge with both endpoints in the set as traversed, which can
//! over-approximate on split/rejoin shapes.

use std::collections::BTreeSet;

use tracing::debug;

use crate::shared::models::{BlockId, Cfg};

/// Add the dominators and post-dominators of every member.
pub fn augment_dominators(cfg: &Cfg, blocks: &BTreeSet<BlockId>) -> BTreeSet<BlockId> {
    let mut result = blocks.clone();
    for &bb in blocks {
        result.extend(cfg.block(bb).doms.iter().copied());
        result.extend(cfg.block(bb).pdoms.iter().copied());
    }
    debug!(from = blocks.len(), to = result.len(), "dominator augmentation");
    result
}

/// Dominator closure plus the implications of unambiguous edges: a member
/// with exactly one predecessor must have arrived through it, and one with
/// exactly one successor must have left through it.
pub fn augment_must_blocks(cfg: &Cfg, blocks: &BTreeSet<BlockId>) -> BTreeSet<BlockId> {
    let mut result = augment_dominators(cfg, blocks);
    let mut implicated: BTreeSet<BlockId> = BTreeSet::new();
    for &bb in &result {
        let block = cfg.block(bb);
        if block.preds.len() == 1 {
            let pred = *block.preds.iter().next().expect("len checked");
            implicated.extend(cfg.block(pred).implicates(bb));
        }
        if block.succs.len() == 1 {
            let succ = *block.succs.iter().next().expect("len checked");
            implicated.extend(block.implicates(succ));
        }
    }
    let before = result.len();
    result.extend(implicated);
    debug!(from = before, to = result.len(), "must-pass augmentation");
    result
}

/// Dominator closure plus the implications of every edge whose endpoints
/// are both in the set. Can add false positives when the execution skipped
/// an inner path between two independently matched blocks.
pub fn augment_aggressive(cfg: &Cfg, blocks: &BTreeSet<BlockId>) -> BTreeSet<BlockId> {
    let mut result = augment_dominators(cfg, blocks);
    let mut implicated: BTreeSet<BlockId> = BTreeSet::new();
    for &bb in &result {
        for &succ in &cfg.block(bb).succs {
            if result.contains(&succ) {
                implicated.extend(cfg.block(bb).implicates(succ));
            }
        }
    }
    let before = result.len();
    result.extend(implicated);
    debug!(from = before, to = result.len(), "aggressive augmentation");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::FuncId;

    /// entry -> mid -> sink with an implication {ghost} on entry -> mid.
    fn implication_cfg() -> (Cfg, FuncId, BlockId, BlockId, BlockId, BlockId) {
        let mut cfg = Cfg::new();
        let f = cfg.add_func(0x1000);
        let entry = cfg.add_block(f, 0x1000, Some(0x100f));
        let mid = cfg.add_block(f, 0x1010, Some(0x101f));
        let sink = cfg.add_block(f, 0x1020, Some(0x102f));
        // The ghost block stands for a removed one: present in the arena,
        // absent from the live graph.
        let ghost = cfg.add_block(f, 0x1030, Some(0x103f));
        cfg.func_mut(f).blocks.remove(&0x1030);
        cfg.add_edge(entry, mid);
        cfg.add_edge(mid, sink);
        cfg.block_mut(entry)
            .edge_implicates
            .insert(mid, BTreeSet::from([ghost]));
        cfg.finalize_lookup();
        cfg.build_dominators();
        (cfg, f, entry, mid, sink, ghost)
    }

    #[test]
    fn dominator_augmentation_is_monotone_and_idempotent() {
        let (cfg, _, _, mid, _, _) = implication_cfg();
        let seed = BTreeSet::from([mid]);
        let once = augment_dominators(&cfg, &seed);
        assert!(once.is_superset(&seed));
        let twice = augment_dominators(&cfg, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn chain_members_pull_in_the_whole_chain() {
        let (cfg, _, entry, mid, sink, _) = implication_cfg();
        let out = augment_dominators(&cfg, &BTreeSet::from([mid]));
        // entry dominates mid; sink post-dominates it.
        assert!(out.contains(&entry));
        assert!(out.contains(&sink));
    }

    #[test]
    fn must_augmentation_reads_single_edge_implications() {
        let (cfg, _, _, mid, _, ghost) = implication_cfg();
        let out = augment_must_blocks(&cfg, &BTreeSet::from([mid]));
        assert!(out.contains(&ghost));
    }

    #[test]
    fn aggressive_augmentation_needs_both_endpoints() {
        let (cfg, _, entry, mid, _, ghost) = implication_cfg();
        let out = augment_aggressive(&cfg, &BTreeSet::from([entry, mid]));
        assert!(out.contains(&ghost));

        // A set without the edge target picks up the implication anyway in
        // this chain because dominator augmentation adds `mid` first.
        let out = augment_aggressive(&cfg, &BTreeSet::from([entry]));
        assert!(out.contains(&ghost));
    }
}
