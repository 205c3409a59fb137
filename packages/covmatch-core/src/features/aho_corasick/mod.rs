//! Aho–Corasick automata over the byte alphabet.
//!
//! One deviation from the textbook automaton: each node's output list is
//! sorted by pattern length ascending, which fixes the emission order the
//! sequence matcher depends on (at equal end positions, shorter matches
//! come first).

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

/// Forward automaton.
pub struct AhoCorasick {
    patterns: Vec<Vec<u8>>,
    /// Trie transitions per node.
    goto_map: Vec<FxHashMap<u8, u32>>,
    /// Failure link per node (root fails to itself).
    failure: Vec<u32>,
    /// Matched pattern ids per node, length-ascending.
    output: Vec<Vec<u32>>,
}

impl AhoCorasick {
    pub fn new(patterns: Vec<Vec<u8>>) -> Self {
        let mut ac = Self {
            patterns,
            goto_map: vec![FxHashMap::default()],
            failure: vec![0],
            output: vec![Vec::new()],
        };
        ac.build();
        ac
    }

    fn add_node(&mut self) -> u32 {
        let id = self.goto_map.len() as u32;
        self.goto_map.push(FxHashMap::default());
        self.failure.push(0);
        self.output.push(Vec::new());
        id
    }

    fn build(&mut self) {
        // Trie
        for pat_id in 0..self.patterns.len() {
            let pattern = self.patterns[pat_id].clone();
            let mut node = 0u32;
            for &byte in &pattern {
                node = match self.goto_map[node as usize].get(&byte) {
                    Some(&next) => next,
                    None => {
                        let next = self.add_node();
                        self.goto_map[node as usize].insert(byte, next);
                        next
                    }
                };
            }
            self.output[node as usize].push(pat_id as u32);
        }

        // Failure links, BFS from the root's children
        let mut queue: VecDeque<u32> = VecDeque::new();
        let root_children: Vec<u32> = self.goto_map[0].values().copied().collect();
        for child in root_children {
            self.failure[child as usize] = 0;
            queue.push_back(child);
        }

        while let Some(node) = queue.pop_front() {
            let transitions: Vec<(u8, u32)> = self.goto_map[node as usize]
                .iter()
                .map(|(&b, &n)| (b, n))
                .collect();
            for (byte, next) in transitions {
                let mut fail = self.failure[node as usize];
                while fail > 0 && !self.goto_map[fail as usize].contains_key(&byte) {
                    fail = self.failure[fail as usize];
                }
                if let Some(&target) = self.goto_map[fail as usize].get(&byte) {
                    fail = target;
                }

                queue.push_back(next);
                self.failure[next as usize] = fail;
                let inherited = self.output[fail as usize].clone();
                self.output[next as usize].extend(inherited);
            }
        }

        // Length-ascending emission order per node
        for out in &mut self.output {
            out.sort_by_key(|&id| self.patterns[id as usize].len());
        }
    }

    /// All matches as `(pattern_id, begin, end)`, ordered by `end`
    /// ascending, ties shortest-first.
    pub fn search_with_positions(&self, text: &[u8]) -> Vec<(usize, usize, usize)> {
        let mut results = Vec::new();
        let mut node = 0u32;
        for (idx, &byte) in text.iter().enumerate() {
            while node > 0 && !self.goto_map[node as usize].contains_key(&byte) {
                node = self.failure[node as usize];
            }
            node = self.goto_map[node as usize].get(&byte).copied().unwrap_or(0);
            for &pat_id in &self.output[node as usize] {
                let len = self.patterns[pat_id as usize].len();
                results.push((pat_id as usize, idx + 1 - len, idx + 1));
            }
        }
        debug_assert!(results.windows(2).all(|w| {
            let (_, b0, e0) = w[0];
            let (_, b1, e1) = w[1];
            e0 < e1 || (e0 == e1 && b0 >= b1)
        }));
        results
    }
}

/// Reversed automaton: patterns are reversed before insertion and the
/// search runs over the reversed text, remapping positions back to the
/// original coordinate frame.
///
/// The point is ordering: downstream the hits are consumed back-to-front,
/// which yields begin-ascending order with longest-first ties, exactly what
/// the greedy sequence matcher wants.
pub struct ReversedAhoCorasick {
    inner: AhoCorasick,
}

impl ReversedAhoCorasick {
    pub fn new(patterns: Vec<Vec<u8>>) -> Self {
        let reversed = patterns
            .into_iter()
            .map(|p| p.into_iter().rev().collect())
            .collect();
        Self {
            inner: AhoCorasick::new(reversed),
        }
    }

    pub fn search_with_positions(&self, text: &[u8]) -> Vec<(usize, usize, usize)> {
        let reversed: Vec<u8> = text.iter().rev().copied().collect();
        self.inner
            .search_with_positions(&reversed)
            .into_iter()
            .map(|(id, begin, end)| (id, text.len() - end, text.len() - begin))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pats(list: &[&[u8]]) -> Vec<Vec<u8>> {
        list.iter().map(|p| p.to_vec()).collect()
    }

    #[test]
    fn empty_text_yields_no_matches() {
        let ac = AhoCorasick::new(pats(&[b"abc"]));
        assert!(ac.search_with_positions(b"").is_empty());
        let rac = ReversedAhoCorasick::new(pats(&[b"abc"]));
        assert!(rac.search_with_positions(b"").is_empty());
    }

    #[test]
    fn overlapping_patterns_all_reported() {
        let ac = AhoCorasick::new(pats(&[b"he", b"she", b"hers"]));
        let hits = ac.search_with_positions(b"ushers");
        assert_eq!(hits, vec![(0, 2, 4), (1, 1, 4), (2, 2, 6)]);
    }

    #[test]
    fn forward_order_is_end_ascending_shortest_first() {
        let ac = AhoCorasick::new(pats(&[b"www", b"w"]));
        let hits = ac.search_with_positions(b"wwww");
        // At end = 3 and 4 both patterns fire; the shorter one first.
        assert_eq!(
            hits,
            vec![
                (1, 0, 1),
                (1, 1, 2),
                (1, 2, 3),
                (0, 0, 3),
                (1, 3, 4),
                (0, 1, 4)
            ]
        );
    }

    #[test]
    fn reversed_search_remaps_to_original_coordinates() {
        let rac = ReversedAhoCorasick::new(pats(&[b"ab", b"bcd"]));
        let mut hits = rac.search_with_positions(b"xabcd");
        hits.sort();
        assert_eq!(hits, vec![(0, 1, 3), (1, 2, 5)]);
    }

    #[test]
    fn suffix_outputs_are_inherited_through_failure_links() {
        let ac = AhoCorasick::new(pats(&[b"bc", b"abc"]));
        let hits = ac.search_with_positions(b"zabc");
        assert_eq!(hits, vec![(0, 2, 4), (1, 1, 4)]);
    }
}
