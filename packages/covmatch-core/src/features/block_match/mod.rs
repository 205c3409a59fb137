//! Literal-to-block matching.
//!
//! Every string literal of the CFG becomes a pattern: the printf-style
//! format specifiers are cut out and the remaining byte atoms are matched
//! per output line through the sequence matcher. A matched literal that is
//! referenced from several blocks is disambiguated by context-driven block
//! identification (CDBI): a beam search that scores each candidate block by
//! its accumulated call-graph distance to the blocks of nearby matches.

pub mod augment;
pub mod similarity;

use std::collections::BTreeSet;
use std::num::NonZeroUsize;

use lru::LruCache;
use once_cell::sync::Lazy;
use regex::bytes::{Regex, RegexBuilder};
use tracing::warn;

use crate::features::call_graph::FuncDistanceMap;
use crate::features::seq_match::{select_longest_matches, MatchItem, RawMatch, SeqMatcher};
use crate::shared::models::{BlockId, Cfg, XrefId};

/// CDBI context window: how many surrounding matches vote.
pub const CONTEXT_SIZE: usize = 5;
/// CDBI beam width.
pub const BEAM_WIDTH: usize = 10;

/// Literals whose non-specifier bytes sum to this many bytes or fewer are
/// too unspecific to index.
const MIN_LITERAL_BYTES: usize = 3;

/// printf-style format specifier.
static FORMAT_SPEC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"%[0 #+-]?[0-9*]*\.?[0-9]*[hl]{0,2}[jztL]?[diuoxXeEfgGaAcpsSn%]")
        .expect("format-specifier regex is valid")
});

/// Pattern index entry: the xref a pattern was built from and whether the
/// literal contained at least one format specifier.
#[derive(Debug, Clone, Copy)]
pub struct MatchInfo {
    pub xref: XrefId,
    pub has_format: bool,
}

/// Drop every trailing newline byte.
fn strip_trailing_newlines(literal: &[u8]) -> &[u8] {
    let end = literal
        .iter()
        .rposition(|&b| b != b'\n')
        .map_or(0, |i| i + 1);
    &literal[..end]
}

/// Split a literal at its format specifiers. Returns `None` when the
/// remaining bytes are too short to be worth indexing.
fn literal_atoms(literal: &[u8]) -> Option<(Vec<Vec<u8>>, bool)> {
    let stripped = strip_trailing_newlines(literal);
    let parts: Vec<&[u8]> = FORMAT_SPEC.split(stripped).collect();
    let has_format = parts.len() > 1;
    let total: usize = parts.iter().map(|p| p.len()).sum();
    if total <= MIN_LITERAL_BYTES {
        return None;
    }
    let atoms = parts
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.to_vec())
        .collect();
    Some((atoms, has_format))
}

fn new_line_cache<V>(capacity: Option<usize>) -> LruCache<Vec<u8>, V> {
    match capacity {
        Some(n) => LruCache::new(NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)),
        None => LruCache::unbounded(),
    }
}

/// Lines of a response, terminators preserved.
pub fn split_lines_keepends(text: &[u8]) -> impl Iterator<Item = &[u8]> {
    text.split_inclusive(|&b| b == b'\n')
}

// ----------------------------------------------------------------------
// CDBI
// ----------------------------------------------------------------------

/// Xrefs voting on one ambiguous match: the gap-filler xrefs first, then
/// alternating successors and predecessors, truncated to the context size.
fn find_nearby_xrefs(
    result_idx: usize,
    results: &[MatchItem],
    sub_xrefs: &[XrefId],
    infos: &[MatchInfo],
) -> Vec<XrefId> {
    let mut nearby: Vec<XrefId> = sub_xrefs.to_vec();
    for i in 1..=CONTEXT_SIZE {
        if let Some(item) = results.get(result_idx + i) {
            nearby.push(infos[item.pat_idx].xref);
        }
        if result_idx >= i {
            nearby.push(infos[results[result_idx - i].pat_idx].xref);
        }
    }
    nearby.truncate(CONTEXT_SIZE);
    nearby
}

/// Context-driven block identification.
///
/// Unambiguous xrefs contribute their single block directly. For each
/// ambiguous one, a beam over its candidate blocks accumulates call-graph
/// distance to every block of every nearby xref; the candidates tied for
/// the lowest accumulated distance are adopted.
pub fn cdbi(
    items: &[MatchItem],
    infos: &[MatchInfo],
    cfg: &Cfg,
    distances: &FuncDistanceMap,
) -> BTreeSet<BlockId> {
    let mut matched: BTreeSet<BlockId> = BTreeSet::new();
    for (i, item) in items.iter().enumerate() {
        let xref = infos[item.pat_idx].xref;
        let sub_xrefs: Vec<XrefId> = item.inner_pats.iter().map(|&p| infos[p].xref).collect();
        // Matches inside %s/%d placeholders count when unambiguous.
        for &sx in &sub_xrefs {
            if cfg.xref(sx).blocks.len() == 1 {
                matched.extend(cfg.xref(sx).blocks.iter().copied());
            }
        }

        let candidates = &cfg.xref(xref).blocks;
        if candidates.len() > 1 {
            let nearby = find_nearby_xrefs(i, items, &sub_xrefs, infos);
            let mut beam: Vec<(BlockId, u32)> = candidates.iter().map(|&b| (b, 0)).collect();
            for nearby_xref in nearby {
                let nearby_blocks = &cfg.xref(nearby_xref).blocks;
                let mut next_beam: Vec<(BlockId, u32)> = Vec::new();
                for &(cur, dist) in &beam {
                    for &nb in nearby_blocks {
                        next_beam
                            .push((cur, dist.saturating_add(distances.block_distance(cfg, cur, nb))));
                    }
                }
                next_beam.sort_by_key(|&(_, d)| d);
                next_beam.truncate(BEAM_WIDTH);
                beam = next_beam;
            }
            if let Some(&(best_block, best_dist)) = beam.first() {
                for &(block, dist) in &beam {
                    if dist != best_dist {
                        break;
                    }
                    matched.insert(block);
                }
                matched.insert(best_block);
            }
        } else {
            matched.extend(candidates.iter().copied());
        }
    }
    matched
}

// ----------------------------------------------------------------------
// Sequence-matcher-backed block matcher (the default)
// ----------------------------------------------------------------------

/// The default matcher: literal atoms through the sequence matcher, one
/// line at a time with a line-level result cache, then CDBI.
pub struct BlockMatcher {
    seq: SeqMatcher,
    idx_to_match_info: Vec<MatchInfo>,
    line_cache: LruCache<Vec<u8>, Vec<MatchItem>>,
}

impl BlockMatcher {
    pub fn new(cfg: &Cfg, cache_capacity: Option<usize>) -> Self {
        let mut patterns: Vec<Vec<Vec<u8>>> = Vec::new();
        let mut idx_to_match_info = Vec::new();
        for xref_id in cfg.xref_ids() {
            let Some((atoms, has_format)) = literal_atoms(&cfg.xref(xref_id).literal) else {
                continue;
            };
            patterns.push(atoms);
            idx_to_match_info.push(MatchInfo {
                xref: xref_id,
                has_format,
            });
        }
        Self {
            seq: SeqMatcher::new(patterns),
            idx_to_match_info,
            line_cache: new_line_cache(cache_capacity),
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.seq.pattern_count()
    }

    /// Match items for the whole response, line by line through the cache.
    fn match_items(&mut self, text: &[u8]) -> Vec<MatchItem> {
        let mut items: Vec<MatchItem> = Vec::new();
        for line in split_lines_keepends(text) {
            if line == b"\n" {
                continue;
            }
            if let Some(cached) = self.line_cache.get(line) {
                items.extend(cached.iter().cloned());
                continue;
            }
            let line_matches = self.seq.search(line);
            items.extend(line_matches.iter().cloned());
            self.line_cache.put(line.to_vec(), line_matches);
        }
        items
    }

    /// Pattern ids matched anywhere in the response.
    pub fn matched_patterns(&mut self, text: &[u8]) -> Vec<usize> {
        let ids: BTreeSet<usize> = self
            .match_items(text)
            .into_iter()
            .map(|item| item.pat_idx)
            .collect();
        ids.into_iter().collect()
    }

    /// Inferred coverage via CDBI.
    pub fn search_blocks(
        &mut self,
        cfg: &Cfg,
        distances: &FuncDistanceMap,
        text: &[u8],
    ) -> BTreeSet<BlockId> {
        let items = self.match_items(text);
        cdbi(&items, &self.idx_to_match_info, cfg, distances)
    }

    /// Baseline without disambiguation: every candidate block of every
    /// matched xref (and of every gap-filler xref) is adopted.
    pub fn search_blocks_union(&mut self, cfg: &Cfg, text: &[u8]) -> BTreeSet<BlockId> {
        let mut matched: BTreeSet<BlockId> = BTreeSet::new();
        for item in self.match_items(text) {
            for &p in &item.inner_pats {
                let sub = self.idx_to_match_info[p].xref;
                matched.extend(cfg.xref(sub).blocks.iter().copied());
            }
            let xref = self.idx_to_match_info[item.pat_idx].xref;
            matched.extend(cfg.xref(xref).blocks.iter().copied());
        }
        matched
    }
}

// ----------------------------------------------------------------------
// Regex baseline
// ----------------------------------------------------------------------

/// Evaluation baseline identical in shape to `BlockMatcher`, but each
/// literal compiles to one regex whose format specifiers become captured
/// `[^\n]*` groups.
pub struct RegexMatcher {
    patterns: Vec<Regex>,
    idx_to_match_info: Vec<MatchInfo>,
    line_cache: LruCache<Vec<u8>, Vec<MatchItem>>,
}

/// Escape literal bytes for a non-unicode bytes regex.
fn escape_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        if b.is_ascii_alphanumeric() {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
    out
}

impl RegexMatcher {
    pub fn new(cfg: &Cfg, cache_capacity: Option<usize>) -> Self {
        let mut patterns = Vec::new();
        let mut idx_to_match_info = Vec::new();
        for xref_id in cfg.xref_ids() {
            let Some((atoms, has_format)) = literal_atoms(&cfg.xref(xref_id).literal) else {
                continue;
            };
            let source = atoms
                .iter()
                .map(|atom| escape_literal(atom))
                .collect::<Vec<_>>()
                .join("([^\\n]*)");
            match RegexBuilder::new(&source).unicode(false).build() {
                Ok(regex) => {
                    patterns.push(regex);
                    idx_to_match_info.push(MatchInfo {
                        xref: xref_id,
                        has_format,
                    });
                }
                Err(err) => {
                    // A literal that does not survive escaping simply
                    // contributes no matches.
                    warn!(?err, "skipping uncompilable literal pattern");
                }
            }
        }
        Self {
            patterns,
            idx_to_match_info,
            line_cache: new_line_cache(cache_capacity),
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    fn match_line(&self, line: &[u8]) -> Vec<MatchItem> {
        let mut line_matches: Vec<RawMatch> = Vec::new();
        for (pat_idx, regex) in self.patterns.iter().enumerate() {
            for caps in regex.captures_iter(line) {
                let whole = caps.get(0).expect("group 0 always participates");
                if whole.start() == whole.end() {
                    continue;
                }
                let gaps: Vec<(usize, usize)> = (1..caps.len())
                    .filter_map(|g| caps.get(g))
                    .map(|g| (g.start(), g.end()))
                    .collect();
                line_matches.push(RawMatch {
                    pat_idx,
                    gaps,
                    begin: whole.start(),
                    end: whole.end(),
                });
            }
        }
        line_matches.sort_by(|a, b| (a.begin, b.end).cmp(&(b.begin, a.end)));
        select_longest_matches(&line_matches, line.len())
    }

    pub fn search_blocks(
        &mut self,
        cfg: &Cfg,
        distances: &FuncDistanceMap,
        text: &[u8],
    ) -> BTreeSet<BlockId> {
        let mut items: Vec<MatchItem> = Vec::new();
        for line in split_lines_keepends(text) {
            if line == b"\n" {
                continue;
            }
            if let Some(cached) = self.line_cache.get(line) {
                items.extend(cached.iter().cloned());
                continue;
            }
            let line_matches = self.match_line(line);
            items.extend(line_matches.iter().cloned());
            self.line_cache.put(line.to_vec(), line_matches);
        }
        cdbi(&items, &self.idx_to_match_info, cfg, distances)
    }
}
