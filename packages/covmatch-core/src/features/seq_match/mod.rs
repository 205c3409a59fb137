//! Gap-aware multi-pattern sequence matching.
//!
//! A pattern is an ordered sequence of byte atoms; the gaps between atoms
//! stand for format-specifier placeholders and match any run of
//! non-newline bytes. Atoms are deduplicated into one reversed
//! Aho–Corasick automaton; full-pattern matches are then assembled per
//! pattern by chaining atom occurrences left to right, and a greedy sweep
//! selects the longest non-overlapping cover, descending once into each
//! captured gap for nested matches.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::features::aho_corasick::ReversedAhoCorasick;

/// A full-pattern match with its captured gap intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch {
    pub pat_idx: usize,
    /// `(gap_begin, gap_end)` per placeholder crossed, left to right.
    pub gaps: Vec<(usize, usize)>,
    pub begin: usize,
    pub end: usize,
}

/// A selected match: gaps are resolved to the pattern ids matched inside
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchItem {
    pub pat_idx: usize,
    pub inner_pats: BTreeSet<usize>,
    pub begin: usize,
    pub end: usize,
}

/// Starting from `min_idx`, find the first match contained in
/// `[begin, end)`. Returns `(index + 1, true)` when found; when a match
/// starts at or after `end`, returns `(index, false)`.
fn query_filler(matches: &[RawMatch], begin: usize, end: usize, min_idx: usize) -> (usize, bool) {
    for idx in min_idx..matches.len() {
        let mi = &matches[idx];
        if mi.begin >= end {
            return (idx, false);
        }
        if mi.begin >= begin && mi.end <= end {
            return (idx + 1, true);
        }
    }
    (matches.len(), false)
}

/// Greedily select the longest non-overlapping matches from the sorted
/// candidate list, resolving each captured gap to the first match fully
/// contained in it (no recursion into deeper gaps).
pub fn select_longest_matches(matches: &[RawMatch], text_len: usize) -> Vec<MatchItem> {
    let mut selected = Vec::new();
    let mut occupied_end = 0usize;
    let mut i = 0usize;
    while i < matches.len() && occupied_end < text_len {
        let (next_idx, has_hit) = query_filler(matches, occupied_end, text_len, i);
        if !has_hit {
            i = next_idx;
            continue;
        }
        let candidate = &matches[next_idx - 1];
        let mut inner_pats = BTreeSet::new();
        for &(gap_begin, gap_end) in &candidate.gaps {
            let (gap_idx, gap_hit) = query_filler(matches, gap_begin, gap_end, next_idx);
            if !gap_hit {
                continue;
            }
            inner_pats.insert(matches[gap_idx - 1].pat_idx);
        }
        occupied_end = candidate.end;
        i = next_idx;
        selected.push(MatchItem {
            pat_idx: candidate.pat_idx,
            inner_pats,
            begin: candidate.begin,
            end: candidate.end,
        });
    }
    selected
}

/// The deduplicated multi-pattern matcher.
pub struct SeqMatcher {
    patterns: Vec<Vec<Vec<u8>>>,
    /// Occurrence index -> (pattern index, atom offset).
    atom_info: Vec<(usize, usize)>,
    /// Unique atom bytes -> occurrence indices.
    occurrences_of: FxHashMap<Vec<u8>, Vec<usize>>,
    /// Automaton symbol order.
    unique_atoms: Vec<Vec<u8>>,
    rac: ReversedAhoCorasick,
}

impl SeqMatcher {
    pub fn new(patterns: Vec<Vec<Vec<u8>>>) -> Self {
        let mut atom_info = Vec::new();
        let mut occurrences_of: FxHashMap<Vec<u8>, Vec<usize>> = FxHashMap::default();
        let mut unique_atoms: Vec<Vec<u8>> = Vec::new();

        for (pat_idx, atoms) in patterns.iter().enumerate() {
            for (atom_idx, atom) in atoms.iter().enumerate() {
                let occurrence = atom_info.len();
                atom_info.push((pat_idx, atom_idx));
                let entry = occurrences_of.entry(atom.clone()).or_default();
                if entry.is_empty() {
                    unique_atoms.push(atom.clone());
                }
                entry.push(occurrence);
            }
        }

        let rac = ReversedAhoCorasick::new(unique_atoms.clone());
        Self {
            patterns,
            atom_info,
            occurrences_of,
            unique_atoms,
            rac,
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Match `text` and return the selected longest non-overlapping cover.
    pub fn search(&self, text: &[u8]) -> Vec<MatchItem> {
        let newline_positions: Vec<usize> = text
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == b'\n')
            .map(|(i, _)| i)
            .collect();

        // Consuming the reversed-automaton hits back to front yields
        // begin-ascending order with longest-first ties.
        let reverse_matches = self.rac.search_with_positions(text);
        let mut pat_matches: FxHashMap<usize, Vec<(usize, usize, usize)>> = FxHashMap::default();
        for &(unique_idx, begin, end) in reverse_matches.iter().rev() {
            let atom = &self.unique_atoms[unique_idx];
            for &occurrence in &self.occurrences_of[atom] {
                let (pat_idx, atom_off) = self.atom_info[occurrence];
                pat_matches
                    .entry(pat_idx)
                    .or_default()
                    .push((atom_off, begin, end));
            }
        }

        let mut full = self.full_matches(&pat_matches, &newline_positions);
        full.sort_by(|a, b| (a.begin, b.end).cmp(&(b.begin, a.end)));
        select_longest_matches(&full, text.len())
    }

    /// Assemble full-pattern matches by chaining atom occurrences in order,
    /// rejecting chains whose gaps cross a newline.
    fn full_matches(
        &self,
        pat_matches: &FxHashMap<usize, Vec<(usize, usize, usize)>>,
        newline_positions: &[usize],
    ) -> Vec<RawMatch> {
        let mut result: Vec<RawMatch> = Vec::new();
        let mut pattern_ids: Vec<usize> = pat_matches.keys().copied().collect();
        pattern_ids.sort();

        for pat_idx in pattern_ids {
            let matches = &pat_matches[&pat_idx];
            debug_assert!(matches.windows(2).all(|w| {
                let (_, b0, e0) = w[0];
                let (_, b1, e1) = w[1];
                b0 < b1 || (b0 == b1 && e0 >= e1)
            }));

            let mut atom_matches: FxHashMap<usize, Vec<(usize, usize)>> = FxHashMap::default();
            for &(atom_off, begin, end) in matches {
                atom_matches.entry(atom_off).or_default().push((begin, end));
            }

            let Some(first_atom_matches) = atom_matches.get(&0) else {
                continue;
            };
            let mut cur_forefront = 0usize;
            for &(begin, first_end) in first_atom_matches {
                let mut gaps = Vec::new();
                let mut last_end = first_end;
                let mut valid = true;
                for atom_off in 1..self.patterns[pat_idx].len() {
                    let Some(next_matches) = atom_matches.get(&atom_off) else {
                        valid = false;
                        break;
                    };
                    let next_idx = next_matches.partition_point(|&(b, _)| b < last_end);
                    if next_idx >= next_matches.len() {
                        valid = false;
                        break;
                    }
                    let (next_begin, next_end) = next_matches[next_idx];
                    if has_newline_between(newline_positions, last_end, next_begin) {
                        valid = false;
                        break;
                    }
                    gaps.push((last_end, next_begin));
                    last_end = next_end;
                }

                if valid {
                    if last_end <= cur_forefront {
                        // A longer chain ending at the same position
                        // supersedes the previous one.
                        assert!(
                            last_end == cur_forefront,
                            "sequence matcher fed unordered atom matches"
                        );
                        result.pop();
                    }
                    result.push(RawMatch {
                        pat_idx,
                        gaps,
                        begin,
                        end: last_end,
                    });
                    cur_forefront = last_end;
                }
            }
        }
        result
    }
}

/// Whether `text[start..end)` contains a newline.
fn has_newline_between(newline_positions: &[usize], start: usize, end: usize) -> bool {
    let idx = newline_positions.partition_point(|&p| p < start);
    idx < newline_positions.len() && newline_positions[idx] < end
}
