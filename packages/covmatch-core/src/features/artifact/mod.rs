//! Static-analysis artifact loading.
//!
//! One directory per target binary, produced by the external disassembly
//! stage:
//!
//! - `CFG_analysis.txt` — JSON function/block/edge/call structure
//! - `pickle_analysis.bin` — string-xref table (MessagePack)
//! - `vertex.txt` — one `0x`-hex block start address per line; the line
//!   number is the dense vertex index used on the wire
//! - `edge.txt` — `hex_src hex_dst` per line; line number is the edge index
//! - `baseaddr.txt` — `0x`-hex ELF base address
//!
//! The loader is the only writer of the CFG arenas; everything downstream
//! mutates through the transformer or reads.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{CovmatchError, Result};
use crate::shared::models::Cfg;

pub const CFG_ANALYSIS_FILE: &str = "CFG_analysis.txt";
pub const XREF_TABLE_FILE: &str = "pickle_analysis.bin";
pub const VERTEX_FILE: &str = "vertex.txt";
pub const EDGE_FILE: &str = "edge.txt";
pub const BASE_ADDR_FILE: &str = "baseaddr.txt";

/// One basic block of `CFG_analysis.txt`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockRecord {
    pub dst_bbs: Vec<u64>,
    pub call_func: Vec<u64>,
    /// Present in the artifact; not consumed.
    #[serde(default)]
    pub xrefs: Vec<u64>,
    pub end_addr: Option<u64>,
    pub parent_funcnode: u64,
}

/// One function of `CFG_analysis.txt`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FuncRecord {
    pub call_func: Vec<u64>,
    #[serde(rename = "BBs")]
    pub blocks: BTreeMap<String, BlockRecord>,
    /// Present in the artifact; not consumed.
    #[serde(default)]
    pub xrefs: Vec<u64>,
}

/// The whole JSON document: function entry address (decimal or `0x`-hex
/// string) to function record.
pub type CfgDocument = BTreeMap<String, FuncRecord>;

/// One literal of the string-xref table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XrefRecord {
    pub ro_addrs: Vec<u64>,
    pub funcnodes: Vec<u64>,
    pub bbs: Vec<u64>,
}

/// Literal bytes to xref record.
pub type XrefTable = BTreeMap<Vec<u8>, XrefRecord>;

/// Everything the core needs from one artifact directory.
#[derive(Debug)]
pub struct StaticAnalysis {
    pub cfg: Cfg,
    /// ELF base address of the analyzed binary.
    pub base_addr: u64,
    /// Block start address to dense vertex index (the wire encoding).
    pub vertex_index: FxHashMap<u64, usize>,
    /// Edge (src, dst) start addresses to edge index. Not consumed by the
    /// matcher pipeline; kept for evaluation tooling parity.
    pub edge_index: FxHashMap<(u64, u64), usize>,
}

/// Parse a decimal or `0x`-prefixed hex address string.
pub fn parse_addr(text: &str) -> Result<u64> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse::<u64>()
    };
    parsed.map_err(|_| CovmatchError::artifact(format!("bad address {text:?}")))
}

/// Load a complete artifact directory.
pub fn load(dir: &Path) -> Result<StaticAnalysis> {
    let mut cfg = build_cfg(&read_cfg_document(&dir.join(CFG_ANALYSIS_FILE))?)?;
    resolve_xrefs(&mut cfg, &read_xref_table(&dir.join(XREF_TABLE_FILE))?);

    let analysis = StaticAnalysis {
        base_addr: read_base_addr(&dir.join(BASE_ADDR_FILE))?,
        vertex_index: read_vertex_index(&dir.join(VERTEX_FILE))?,
        edge_index: read_edge_index(&dir.join(EDGE_FILE))?,
        cfg,
    };
    debug!(
        funcs = analysis.cfg.num_funcs(),
        blocks = analysis.cfg.num_blocks(),
        edges = analysis.cfg.num_edges(),
        vertices = analysis.vertex_index.len(),
        "loaded static-analysis artifact"
    );
    Ok(analysis)
}

pub fn read_cfg_document(path: &Path) -> Result<CfgDocument> {
    let file = File::open(path)
        .map_err(|e| CovmatchError::artifact(format!("{}: {e}", path.display())))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| CovmatchError::artifact(format!("{}: {e}", path.display())))
}

pub fn read_xref_table(path: &Path) -> Result<XrefTable> {
    let file = File::open(path)
        .map_err(|e| CovmatchError::artifact(format!("{}: {e}", path.display())))?;
    rmp_serde::from_read(BufReader::new(file))
        .map_err(|e| CovmatchError::artifact(format!("{}: {e}", path.display())))
}

/// Serialize a string-xref table, the counterpart of `read_xref_table`.
/// Used by artifact-producing tooling and tests.
pub fn write_xref_table(path: &Path, table: &XrefTable) -> Result<()> {
    let bytes = rmp_serde::to_vec(table)
        .map_err(|e| CovmatchError::artifact(format!("{}: {e}", path.display())))?;
    let mut file = File::create(path)?;
    file.write_all(&bytes)?;
    Ok(())
}

/// Instantiate the arenas from the parsed JSON document.
///
/// Functions and blocks are created in ascending address order so arena ids
/// agree with address order; edges and calls are wired in a second sweep.
fn build_cfg(doc: &CfgDocument) -> Result<Cfg> {
    let mut cfg = Cfg::new();

    let mut funcs: Vec<(u64, &FuncRecord)> = Vec::with_capacity(doc.len());
    for (addr_text, record) in doc {
        funcs.push((parse_addr(addr_text)?, record));
    }
    funcs.sort_by_key(|&(addr, _)| addr);

    for &(func_addr, record) in &funcs {
        let func = cfg.add_func(func_addr);
        let mut blocks: Vec<(u64, &BlockRecord)> = Vec::with_capacity(record.blocks.len());
        for (bb_text, bb) in &record.blocks {
            blocks.push((parse_addr(bb_text)?, bb));
        }
        blocks.sort_by_key(|&(addr, _)| addr);
        for (bb_addr, bb) in blocks {
            if bb.parent_funcnode != func_addr {
                return Err(CovmatchError::artifact(format!(
                    "block {bb_addr:#x} claims parent {:#x} inside function {func_addr:#x}",
                    bb.parent_funcnode
                )));
            }
            cfg.add_block(func, bb_addr, bb.end_addr);
        }
    }

    for &(func_addr, record) in &funcs {
        let func = cfg
            .func_at_addr(func_addr)
            .expect("function registered above");
        for (bb_text, bb) in &record.blocks {
            let bb_addr = parse_addr(bb_text)?;
            let src = cfg.func(func).blocks[&bb_addr];
            for &dst_addr in &bb.dst_bbs {
                let dst = *cfg.func(func).blocks.get(&dst_addr).ok_or_else(|| {
                    CovmatchError::artifact(format!(
                        "edge {bb_addr:#x} -> {dst_addr:#x} leaves function {func_addr:#x}"
                    ))
                })?;
                cfg.add_edge(src, dst);
            }
            for &callee_addr in &bb.call_func {
                let callee = cfg.func_at_addr(callee_addr).ok_or_else(|| {
                    CovmatchError::artifact(format!(
                        "call {bb_addr:#x} -> {callee_addr:#x} targets an unknown function"
                    ))
                })?;
                cfg.add_call(src, callee);
            }
        }
    }

    cfg.finalize_lookup();
    Ok(cfg)
}

/// Wire the literal table into the arenas. A `(funcnode, bb)` pair only
/// resolves when the bb address exists in that function's block map.
fn resolve_xrefs(cfg: &mut Cfg, table: &XrefTable) {
    for (literal, record) in table {
        let xref = cfg.add_xref(literal.clone());
        for &ro in &record.ro_addrs {
            cfg.xref_mut(xref).ro_addrs.insert(ro);
        }
        for &func_addr in &record.funcnodes {
            let Some(func) = cfg.func_at_addr(func_addr) else {
                continue;
            };
            for &bb_addr in &record.bbs {
                if let Some(&block) = cfg.func(func).blocks.get(&bb_addr) {
                    cfg.attach_xref(block, xref);
                }
            }
        }
    }
}

fn read_base_addr(path: &Path) -> Result<u64> {
    let text = fs::read_to_string(path)
        .map_err(|e| CovmatchError::artifact(format!("{}: {e}", path.display())))?;
    parse_addr(&text)
}

fn read_vertex_index(path: &Path) -> Result<FxHashMap<u64, usize>> {
    let text = fs::read_to_string(path)
        .map_err(|e| CovmatchError::artifact(format!("{}: {e}", path.display())))?;
    let mut index = FxHashMap::default();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        index.insert(parse_addr(line)?, idx);
    }
    Ok(index)
}

fn read_edge_index(path: &Path) -> Result<FxHashMap<(u64, u64), usize>> {
    let text = fs::read_to_string(path)
        .map_err(|e| CovmatchError::artifact(format!("{}: {e}", path.display())))?;
    let mut index = FxHashMap::default();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (src, dst) = line.split_once(' ').ok_or_else(|| {
            CovmatchError::artifact(format!("{}: bad edge line {line:?}", path.display()))
        })?;
        index.insert((parse_addr(src)?, parse_addr(dst)?), idx);
    }
    Ok(index)
}
