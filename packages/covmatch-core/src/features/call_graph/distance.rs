//! Pairwise function distance.
//!
//! For an ordered pair `(f1, f2)` the distance is the minimum of
//! `d1(c) + d2(c)` over common ancestors `c` in the caller tree, where `dk`
//! is the BFS distance from `fk` along caller edges. Symmetric by
//! construction; pairs with no common caller get a fixed sentinel larger
//! than any realistic call-graph diameter.

use std::collections::{BTreeSet, VecDeque};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::shared::models::{BlockId, Cfg, FuncId};

/// Distance assigned when two functions share no caller.
pub const DISCONNECTED_DISTANCE: u32 = 100;

/// Dense symmetric distance matrix over the live functions of a frozen CFG.
pub struct FuncDistanceMap {
    index_of: FxHashMap<FuncId, usize>,
    matrix: Vec<u32>,
    n: usize,
}

impl FuncDistanceMap {
    /// Build the matrix. Quadratic in the number of live functions; runs
    /// once at startup on the minimized graph.
    pub fn build(cfg: &Cfg) -> Self {
        let funcs = cfg.func_ids();
        let n = funcs.len();
        let index_of: FxHashMap<FuncId, usize> =
            funcs.iter().enumerate().map(|(i, &f)| (f, i)).collect();

        let caller_dists: Vec<FxHashMap<FuncId, u32>> = funcs
            .iter()
            .map(|&f| caller_distances(cfg, f))
            .collect();

        let mut matrix = vec![DISCONNECTED_DISTANCE; n * n];
        for i in 0..n {
            for j in i..n {
                let (small, large) = if caller_dists[i].len() <= caller_dists[j].len() {
                    (&caller_dists[i], &caller_dists[j])
                } else {
                    (&caller_dists[j], &caller_dists[i])
                };
                let mut min_dist = DISCONNECTED_DISTANCE;
                for (func, &d1) in small {
                    if let Some(&d2) = large.get(func) {
                        min_dist = min_dist.min(d1.saturating_add(d2));
                    }
                }
                matrix[i * n + j] = min_dist;
                matrix[j * n + i] = min_dist;
            }
        }

        debug!(funcs = n, "built function distance map");
        Self {
            index_of,
            matrix,
            n,
        }
    }

    /// Distance between two functions. Unknown functions are treated as
    /// disconnected.
    pub fn func_distance(&self, f1: FuncId, f2: FuncId) -> u32 {
        match (self.index_of.get(&f1), self.index_of.get(&f2)) {
            (Some(&i), Some(&j)) => self.matrix[i * self.n + j],
            _ => DISCONNECTED_DISTANCE,
        }
    }

    /// Distance between the parent functions of two blocks.
    pub fn block_distance(&self, cfg: &Cfg, b1: BlockId, b2: BlockId) -> u32 {
        self.func_distance(cfg.block(b1).func, cfg.block(b2).func)
    }
}

/// BFS along caller edges (call site → containing function), starting at
/// distance 0 from `func` itself.
fn caller_distances(cfg: &Cfg, func: FuncId) -> FxHashMap<FuncId, u32> {
    let mut distances: FxHashMap<FuncId, u32> = FxHashMap::default();
    distances.insert(func, 0);
    let mut queue = VecDeque::from([func]);
    while let Some(current) = queue.pop_front() {
        let current_dist = distances[&current];
        let callers: BTreeSet<FuncId> = cfg
            .func(current)
            .call_sites
            .iter()
            .map(|&site| cfg.block(site).func)
            .collect();
        for caller in callers {
            distances.entry(caller).or_insert_with(|| {
                queue.push_back(caller);
                current_dist + 1
            });
        }
    }
    distances
}
