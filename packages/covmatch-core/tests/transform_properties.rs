//! Property-based tests for the minimization passes.
//!
//! Invariants that should hold for ALL randomly shaped CFGs:
//! - Fixpoint: rerunning any pass after `run_all_passes` changes nothing
//! - Implication entries only sit on edges that exist
//! - Xref back-references end up inside the live block set
//! - Node removal preserves reachability from the entry
//! - Recorded implications are sound against the original graph

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use proptest::prelude::*;

use covmatch_core::features::transform::CfgTransformer;
use covmatch_core::shared::models::{BlockId, Cfg, FuncId};

/// Blueprint for one randomly shaped function: a block count, arbitrary
/// intra-function edges (self-loops and unreachable corners included), and
/// a sprinkling of literal references.
#[derive(Debug, Clone)]
struct CfgBlueprint {
    block_count: usize,
    edges: Vec<(usize, usize)>,
    literal_marks: Vec<(usize, u8)>,
}

fn arb_blueprint() -> impl Strategy<Value = CfgBlueprint> {
    (2usize..=9).prop_flat_map(|block_count| {
        (
            Just(block_count),
            proptest::collection::vec((0..block_count, 0..block_count), 0..block_count * 2),
            proptest::collection::vec((0..block_count, 0u8..4), 0..block_count),
        )
            .prop_map(|(block_count, edges, literal_marks)| CfgBlueprint {
                block_count,
                edges,
                literal_marks,
            })
    })
}

fn build_cfg(blueprint: &CfgBlueprint) -> (Cfg, FuncId, Vec<BlockId>) {
    let mut cfg = Cfg::new();
    let func = cfg.add_func(0x1000);
    let blocks: Vec<BlockId> = (0..blueprint.block_count)
        .map(|i| {
            let addr = 0x1000 + 0x10 * i as u64;
            cfg.add_block(func, addr, Some(addr + 0xf))
        })
        .collect();
    for &(src, dst) in &blueprint.edges {
        cfg.add_edge(blocks[src], blocks[dst]);
    }
    // The entry always references a literal so the function stays in the
    // interesting set.
    let anchor = cfg.add_xref(b"anchor literal".to_vec());
    cfg.attach_xref(blocks[0], anchor);
    for &(idx, mark) in &blueprint.literal_marks {
        let xref = cfg.add_xref(format!("marked literal {mark}").into_bytes());
        cfg.attach_xref(blocks[idx], xref);
    }
    cfg.finalize_lookup();
    (cfg, func, blocks)
}

/// Successor snapshot, taken before any transformation.
fn successor_snapshot(cfg: &Cfg, blocks: &[BlockId]) -> BTreeMap<BlockId, Vec<BlockId>> {
    blocks
        .iter()
        .map(|&b| (b, cfg.block(b).succs.iter().copied().collect()))
        .collect()
}

fn reachable_from(edges: &BTreeMap<BlockId, Vec<BlockId>>, start: BlockId) -> BTreeSet<BlockId> {
    let mut reached = BTreeSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(cur) = queue.pop_front() {
        for &next in &edges[&cur] {
            if reached.insert(next) {
                queue.push_back(next);
            }
        }
    }
    reached
}

fn live_blocks(cfg: &Cfg, func: FuncId) -> BTreeSet<BlockId> {
    cfg.func(func).block_ids().into_iter().collect()
}

fn run_remove_to_fixpoint(cfg: &mut Cfg) {
    let mut transformer = CfgTransformer::new();
    while transformer.run_node_remove_pass(cfg) {}
}

/// Is there an original path `p -> ... -> s` whose interior blocks are all
/// removed (non-live) and different from `avoid`? Such a path would
/// contradict an implication claiming `avoid` must have been traversed.
fn detour_exists(
    original: &BTreeMap<BlockId, Vec<BlockId>>,
    live: &BTreeSet<BlockId>,
    p: BlockId,
    s: BlockId,
    avoid: BlockId,
) -> bool {
    let mut visited: BTreeSet<BlockId> = BTreeSet::new();
    let mut queue = VecDeque::from([p]);
    while let Some(cur) = queue.pop_front() {
        for &next in &original[&cur] {
            if next == s {
                return true;
            }
            if next == avoid || live.contains(&next) {
                continue;
            }
            if visited.insert(next) {
                queue.push_back(next);
            }
        }
    }
    false
}

proptest! {
    #[test]
    fn prop_minimization_reaches_a_stable_fixpoint(blueprint in arb_blueprint()) {
        let (mut cfg, _, _) = build_cfg(&blueprint);
        let mut transformer = CfgTransformer::new();
        transformer.run_all_passes(&mut cfg);

        // Implication entries only sit on existing edges.
        transformer.verify_cfg(&cfg);

        // Rerunning any pass on the fixpoint changes nothing.
        prop_assert!(!transformer.run_inliner_pass(&mut cfg));
        prop_assert!(!transformer.run_node_remove_pass(&mut cfg));
        prop_assert!(!transformer.run_node_merge_pass(&mut cfg));
    }

    #[test]
    fn prop_blocks_belong_to_exactly_one_function(blueprint in arb_blueprint()) {
        let (mut cfg, _, _) = build_cfg(&blueprint);
        let mut transformer = CfgTransformer::new();
        transformer.run_all_passes(&mut cfg);

        for func in cfg.func_ids() {
            for (&addr, &block) in &cfg.func(func).blocks {
                prop_assert_eq!(cfg.block(block).start_addr, addr);
                prop_assert_eq!(cfg.block(block).func, func);
            }
        }
    }

    #[test]
    fn prop_xref_back_references_stay_live(blueprint in arb_blueprint()) {
        let (mut cfg, _, _) = build_cfg(&blueprint);
        let mut transformer = CfgTransformer::new();
        transformer.run_all_passes(&mut cfg);

        let live: BTreeSet<BlockId> = cfg
            .func_ids()
            .into_iter()
            .flat_map(|f| cfg.func(f).block_ids())
            .collect();
        for xref in cfg.xref_ids() {
            prop_assert!(cfg.xref(xref).blocks.is_subset(&live));
        }
    }

    #[test]
    fn prop_merge_pass_is_idempotent(blueprint in arb_blueprint()) {
        let (mut cfg, _, _) = build_cfg(&blueprint);
        let mut transformer = CfgTransformer::new();
        transformer.run_node_merge_pass(&mut cfg);
        prop_assert!(!transformer.run_node_merge_pass(&mut cfg));
    }

    #[test]
    fn prop_node_removal_preserves_reachability(blueprint in arb_blueprint()) {
        let (mut cfg, func, blocks) = build_cfg(&blueprint);
        let original = successor_snapshot(&cfg, &blocks);
        let originally_reachable = reachable_from(&original, blocks[0]);

        run_remove_to_fixpoint(&mut cfg);

        let minimized = successor_snapshot(&cfg, &cfg.func(func).block_ids());
        let now_reachable = reachable_from(&minimized, blocks[0]);
        for block in live_blocks(&cfg, func) {
            if originally_reachable.contains(&block) {
                prop_assert!(
                    now_reachable.contains(&block),
                    "block {:#x} lost its path from the entry",
                    cfg.block(block).start_addr
                );
            }
        }
    }

    #[test]
    fn prop_recorded_implications_are_sound(blueprint in arb_blueprint()) {
        let (mut cfg, func, blocks) = build_cfg(&blueprint);
        let original = successor_snapshot(&cfg, &blocks);

        run_remove_to_fixpoint(&mut cfg);
        let live = live_blocks(&cfg, func);

        for &p in &live {
            for (&s, implicated) in &cfg.block(p).edge_implicates {
                for &b in implicated {
                    // Only removed blocks are ever implicated, and each one
                    // must lie on every spliced-out path from p to s.
                    prop_assert!(!live.contains(&b));
                    prop_assert!(
                        !detour_exists(&original, &live, p, s, b),
                        "edge {:#x} -> {:#x} wrongly implies {:#x}",
                        cfg.block(p).start_addr,
                        cfg.block(s).start_addr,
                        cfg.block(b).start_addr
                    );
                }
            }
        }
    }
}
