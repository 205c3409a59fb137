//! Similarity baseline matcher.
//!
//! Per output line, every literal whose composite similarity exceeds a
//! threshold contributes all of its blocks. The metric combines normalized
//! Levenshtein distance with the longest common substring:
//!
//! `sim(a, b) = max(1 − lev(a, b) / max(|a|, |b|), lcs(a, b) / min(|a|, |b|))`

use std::collections::BTreeSet;

use lru::LruCache;

use crate::shared::models::{BlockId, Cfg, XrefId};

use super::new_line_cache;

/// Levenshtein edit distance (Wagner–Fischer, two-row).
pub fn levenshtein_distance(a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev_row: Vec<usize> = (0..=b.len()).collect();
    let mut curr_row: Vec<usize> = vec![0; b.len() + 1];

    for i in 1..=a.len() {
        curr_row[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr_row[j] = (prev_row[j] + 1)
                .min(curr_row[j - 1] + 1)
                .min(prev_row[j - 1] + cost);
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }
    prev_row[b.len()]
}

/// Length of the longest common substring (contiguous).
pub fn longest_common_substring(a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    let mut best = 0usize;
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            if a[i - 1] == b[j - 1] {
                curr[j] = prev[j - 1] + 1;
                best = best.max(curr[j]);
            } else {
                curr[j] = 0;
            }
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    best
}

/// Composite similarity in `[0, 1]`. Empty inputs compare as dissimilar.
pub fn similarity(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let max_len = a.len().max(b.len()) as f64;
    let min_len = a.len().min(b.len()) as f64;
    let lev = 1.0 - levenshtein_distance(a, b) as f64 / max_len;
    let lcs = longest_common_substring(a, b) as f64 / min_len;
    lev.max(lcs)
}

/// Threshold-based matcher over whole lines, with a line-level cache.
pub struct SimilarityMatcher {
    threshold: f64,
    line_cache: LruCache<Vec<u8>, BTreeSet<XrefId>>,
}

impl SimilarityMatcher {
    pub fn new(threshold: f64, cache_capacity: Option<usize>) -> Self {
        Self {
            threshold,
            line_cache: new_line_cache(cache_capacity),
        }
    }

    /// Xrefs whose literal is sufficiently similar to any response line.
    pub fn matched_xrefs(&mut self, cfg: &Cfg, response: &[u8]) -> BTreeSet<XrefId> {
        let mut result: BTreeSet<XrefId> = BTreeSet::new();
        for line in super::split_lines_keepends(response) {
            if line.is_empty() {
                continue;
            }
            if let Some(cached) = self.line_cache.get(line) {
                result.extend(cached.iter().copied());
                continue;
            }
            let mut line_xrefs: BTreeSet<XrefId> = BTreeSet::new();
            for xref_id in cfg.xref_ids() {
                if similarity(line, &cfg.xref(xref_id).literal) > self.threshold {
                    line_xrefs.insert(xref_id);
                }
            }
            result.extend(line_xrefs.iter().copied());
            self.line_cache.put(line.to_vec(), line_xrefs);
        }
        result
    }

    /// Union of every matched xref's blocks.
    pub fn search_blocks(&mut self, cfg: &Cfg, response: &[u8]) -> BTreeSet<BlockId> {
        let mut coverage: BTreeSet<BlockId> = BTreeSet::new();
        for xref in self.matched_xrefs(cfg, response) {
            coverage.extend(cfg.xref(xref).blocks.iter().copied());
        }
        coverage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein_distance(b"", b""), 0);
        assert_eq!(levenshtein_distance(b"abc", b""), 3);
        assert_eq!(levenshtein_distance(b"kitten", b"sitting"), 3);
        assert_eq!(levenshtein_distance(b"same", b"same"), 0);
    }

    #[test]
    fn lcs_is_contiguous() {
        assert_eq!(longest_common_substring(b"abcdef", b"zabcy"), 3); // "abc"
        assert_eq!(longest_common_substring(b"ab", b"ba"), 1);
        assert_eq!(longest_common_substring(b"", b"x"), 0);
    }

    #[test]
    fn similarity_of_identical_strings_is_one() {
        assert!((similarity(b"error: out of memory", b"error: out of memory") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn similarity_reflects_shared_substrings() {
        // The whole literal appears inside the longer line: lcs/min = 1.0.
        let line = b"prefix error: out of memory suffix";
        let literal = b"error: out of memory";
        assert!((similarity(line, literal) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn threshold_gates_the_match() {
        let mut cfg = Cfg::new();
        let f = cfg.add_func(0x1000);
        let bb = cfg.add_block(f, 0x1000, Some(0x100f));
        let xref = cfg.add_xref(b"checksum mismatch\n".to_vec());
        cfg.attach_xref(bb, xref);
        cfg.finalize_lookup();

        let mut low = SimilarityMatcher::new(0.35, None);
        let mut high = SimilarityMatcher::new(0.70, None);
        let response = b"checksum mismatch\n";
        assert!(low.search_blocks(&cfg, response).contains(&bb));
        assert!(high.search_blocks(&cfg, response).contains(&bb));

        let unrelated = b"0192837465554433221100\n";
        assert!(low.search_blocks(&cfg, unrelated).is_empty());
        assert!(high.search_blocks(&cfg, unrelated).is_empty());
    }
}
