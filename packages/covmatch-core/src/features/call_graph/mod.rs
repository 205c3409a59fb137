//! Call graph over the interesting functions.
//!
//! Built from the functions that (still) reference a string literal plus
//! their transitive callers. Tarjan SCCs, the contracted DAG and the
//! reverse topological order schedule the bottom-up inlining pass; the
//! function distance map is the similarity metric behind context-driven
//! block identification.

mod distance;

pub use distance::{FuncDistanceMap, DISCONNECTED_DISTANCE};

use std::collections::VecDeque;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::shared::models::{Cfg, FuncId};

/// Directed call graph (caller → callee) with SCC structure.
pub struct CallGraph {
    graph: DiGraph<FuncId, ()>,
    node_of: FxHashMap<FuncId, NodeIndex>,
    /// SCC id per graph node index.
    scc_ids: Vec<usize>,
    scc_count: usize,
    /// Contracted DAG: edge `scc_a -> scc_b` iff an original edge crosses
    /// from a node in `scc_a` to one in `scc_b`, `a != b`.
    scc_dag: Vec<Vec<usize>>,
    /// Member functions per SCC, ascending by id.
    scc_members: Vec<Vec<FuncId>>,
}

impl CallGraph {
    /// Build the graph from the seed set, expanding through call sites to
    /// every transitive caller.
    pub fn build(cfg: &Cfg, init_funcs: &[FuncId]) -> Self {
        let mut graph: DiGraph<FuncId, ()> = DiGraph::new();
        let mut node_of: FxHashMap<FuncId, NodeIndex> = FxHashMap::default();
        let mut queue: VecDeque<FuncId> = VecDeque::new();

        for &f in init_funcs {
            if !node_of.contains_key(&f) {
                node_of.insert(f, graph.add_node(f));
                queue.push_back(f);
            }
        }

        while let Some(callee) = queue.pop_front() {
            let sites: Vec<_> = cfg.func(callee).call_sites.iter().copied().collect();
            for site in sites {
                let caller = cfg.block(site).func;
                let caller_node = match node_of.get(&caller) {
                    Some(&n) => n,
                    None => {
                        let n = graph.add_node(caller);
                        node_of.insert(caller, n);
                        queue.push_back(caller);
                        n
                    }
                };
                graph.update_edge(caller_node, node_of[&callee], ());
            }
        }

        let sccs = tarjan_scc(&graph);
        let scc_count = sccs.len();
        let mut scc_ids = vec![0usize; graph.node_count()];
        let mut scc_members: Vec<Vec<FuncId>> = Vec::with_capacity(scc_count);
        for (id, scc) in sccs.iter().enumerate() {
            let mut members: Vec<FuncId> = scc.iter().map(|&n| graph[n]).collect();
            members.sort();
            for &n in scc {
                scc_ids[n.index()] = id;
            }
            scc_members.push(members);
        }

        let mut scc_dag: Vec<Vec<usize>> = vec![Vec::new(); scc_count];
        for edge in graph.edge_references() {
            let a = scc_ids[edge.source().index()];
            let b = scc_ids[edge.target().index()];
            if a != b && !scc_dag[a].contains(&b) {
                scc_dag[a].push(b);
            }
        }

        debug!(
            vertices = graph.node_count(),
            sccs = scc_count,
            "built call graph"
        );

        Self {
            graph,
            node_of,
            scc_ids,
            scc_count,
            scc_dag,
            scc_members,
        }
    }

    pub fn contains(&self, func: FuncId) -> bool {
        self.node_of.contains_key(&func)
    }

    /// Every function in the graph, in insertion (discovery) order.
    pub fn funcs(&self) -> Vec<FuncId> {
        self.graph.node_weights().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn scc_count(&self) -> usize {
        self.scc_count
    }

    /// SCC id of a member function. Panics if the function is not in the
    /// graph; callers gate on `contains`.
    pub fn scc_of(&self, func: FuncId) -> usize {
        self.scc_ids[self.node_of[&func].index()]
    }

    /// Member functions of one SCC, ascending by id.
    pub fn scc_members(&self, scc: usize) -> &[FuncId] {
        &self.scc_members[scc]
    }

    /// SCC ids ordered so that every SCC precedes the SCCs that call into
    /// it (callees first). Iterative DFS post-order over the contracted
    /// DAG; the post-order itself is already the required order.
    pub fn reverse_topological_sort(&self) -> Vec<usize> {
        let mut visited = vec![false; self.scc_count];
        let mut order = Vec::with_capacity(self.scc_count);
        for start in 0..self.scc_count {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            while let Some(frame) = stack.last_mut() {
                let (v, child) = *frame;
                if child < self.scc_dag[v].len() {
                    frame.1 += 1;
                    let w = self.scc_dag[v][child];
                    if !visited[w] {
                        visited[w] = true;
                        stack.push((w, 0));
                    }
                } else {
                    order.push(v);
                    stack.pop();
                }
            }
        }
        order
    }

    /// All member functions in callees-first order.
    pub fn bottom_up_order(&self) -> Vec<FuncId> {
        let mut result = Vec::with_capacity(self.graph.node_count());
        for scc in self.reverse_topological_sort() {
            result.extend_from_slice(&self.scc_members[scc]);
        }
        result
    }
}
