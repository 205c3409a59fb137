//! End-to-end pipeline: synthesize a static-analysis artifact on disk, load
//! it, minimize, and serve requests from captured output files.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use pretty_assertions::assert_eq;

use covmatch_core::config::{MatcherSelect, ServerConfig};
use covmatch_core::features::artifact::{
    self, BlockRecord, CfgDocument, FuncRecord, XrefRecord, XrefTable, BASE_ADDR_FILE,
    CFG_ANALYSIS_FILE, EDGE_FILE, VERTEX_FILE, XREF_TABLE_FILE,
};
use covmatch_core::features::server::{FuzzServer, EDGES_FILE, STDERR_FILE, STDOUT_FILE};

fn block(dst: &[u64], calls: &[u64], end: u64, parent: u64) -> BlockRecord {
    BlockRecord {
        dst_bbs: dst.to_vec(),
        call_func: calls.to_vec(),
        xrefs: Vec::new(),
        end_addr: Some(end),
        parent_funcnode: parent,
    }
}

/// main @ 0x1000:  0x1000 "fuzz target started" -> 0x1010 (calls parse)
///                 -> 0x1020 "done in %d ms" (sink)
/// parse @ 0x2000: 0x2000 "parse error: %s" -> 0x2010 (sink)
fn write_artifact(dir: &Path) {
    let mut doc = CfgDocument::new();
    doc.insert(
        "4096".to_string(),
        FuncRecord {
            call_func: vec![0x2000],
            blocks: BTreeMap::from([
                ("4096".to_string(), block(&[0x1010], &[], 0x100f, 0x1000)),
                ("4112".to_string(), block(&[0x1020], &[0x2000], 0x101f, 0x1000)),
                ("4128".to_string(), block(&[], &[], 0x102f, 0x1000)),
            ]),
            xrefs: Vec::new(),
        },
    );
    doc.insert(
        "8192".to_string(),
        FuncRecord {
            call_func: vec![],
            blocks: BTreeMap::from([
                ("8192".to_string(), block(&[0x2010], &[], 0x200f, 0x2000)),
                ("8208".to_string(), block(&[], &[], 0x201f, 0x2000)),
            ]),
            xrefs: Vec::new(),
        },
    );
    fs::write(
        dir.join(CFG_ANALYSIS_FILE),
        serde_json::to_string(&doc).unwrap(),
    )
    .unwrap();

    let mut table = XrefTable::new();
    table.insert(
        b"fuzz target started\n".to_vec(),
        XrefRecord {
            ro_addrs: vec![0x5000],
            funcnodes: vec![0x1000],
            bbs: vec![0x1000],
        },
    );
    table.insert(
        b"done in %d ms\n".to_vec(),
        XrefRecord {
            ro_addrs: vec![0x5020],
            funcnodes: vec![0x1000],
            bbs: vec![0x1020],
        },
    );
    table.insert(
        b"parse error: %s\n".to_vec(),
        XrefRecord {
            ro_addrs: vec![0x5040],
            funcnodes: vec![0x2000],
            bbs: vec![0x2000],
        },
    );
    artifact::write_xref_table(&dir.join(XREF_TABLE_FILE), &table).unwrap();

    fs::write(
        dir.join(VERTEX_FILE),
        "0x1000\n0x1010\n0x1020\n0x2000\n0x2010\n",
    )
    .unwrap();
    fs::write(
        dir.join(EDGE_FILE),
        "0x1000 0x1010\n0x1010 0x1020\n0x2000 0x2010\n",
    )
    .unwrap();
    fs::write(dir.join(BASE_ADDR_FILE), "0x400000\n").unwrap();
}

fn server_config(artifact_dir: &Path, out_dir: &Path, matcher: MatcherSelect) -> ServerConfig {
    ServerConfig {
        static_analysis_dir: artifact_dir.to_path_buf(),
        out_dir: out_dir.to_path_buf(),
        max_lines: 5000,
        matcher,
        oneshot: true,
        line_cache_capacity: None,
    }
}

fn write_response(out_dir: &Path, stdout: &[u8], stderr: &[u8]) {
    fs::write(out_dir.join(STDOUT_FILE), stdout).unwrap();
    fs::write(out_dir.join(STDERR_FILE), stderr).unwrap();
}

#[test]
fn artifact_loads_and_minimizes() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path());
    let out = tempfile::tempdir().unwrap();

    let server = FuzzServer::bootstrap(server_config(
        dir.path(),
        out.path(),
        MatcherSelect::Cdbi,
    ))
    .unwrap();

    // parse is inlined into main (single call site); the call-site block
    // and the former parse sink are spliced out as uninteresting.
    let cfg = server.cfg();
    assert_eq!(cfg.num_funcs(), 1);
    assert_eq!(cfg.num_blocks(), 3);
}

#[test]
fn coverage_is_emitted_as_vertex_indices() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path());
    let out = tempfile::tempdir().unwrap();

    let mut server = FuzzServer::bootstrap(server_config(
        dir.path(),
        out.path(),
        MatcherSelect::Cdbi,
    ))
    .unwrap();

    write_response(
        out.path(),
        b"fuzz target started\nparse error: bad magic\n",
        b"",
    );
    server.process_request().unwrap();

    // 0x1000 is vertex 0, 0x2000 is vertex 3.
    let edges = fs::read_to_string(out.path().join(EDGES_FILE)).unwrap();
    assert_eq!(edges, "0\n3\n");
}

#[test]
fn duplicate_responses_yield_empty_coverage() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path());
    let out = tempfile::tempdir().unwrap();

    let mut server = FuzzServer::bootstrap(server_config(
        dir.path(),
        out.path(),
        MatcherSelect::Cdbi,
    ))
    .unwrap();

    write_response(out.path(), b"fuzz target started\n", b"");
    server.process_request().unwrap();
    let first = fs::read_to_string(out.path().join(EDGES_FILE)).unwrap();
    assert_eq!(first, "0\n");

    server.process_request().unwrap();
    let second = fs::read_to_string(out.path().join(EDGES_FILE)).unwrap();
    assert_eq!(second, "");
}

#[test]
fn consecutive_duplicate_lines_are_collapsed_before_hashing() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path());
    let out = tempfile::tempdir().unwrap();

    let mut server = FuzzServer::bootstrap(server_config(
        dir.path(),
        out.path(),
        MatcherSelect::Cdbi,
    ))
    .unwrap();

    write_response(out.path(), b"fuzz target started\n", b"");
    server.process_request().unwrap();

    // The same line repeated collapses to the first response's bytes, so
    // the dedup-by-hash kicks in and the coverage is empty.
    write_response(
        out.path(),
        b"fuzz target started\nfuzz target started\nfuzz target started\n",
        b"",
    );
    server.process_request().unwrap();
    let second = fs::read_to_string(out.path().join(EDGES_FILE)).unwrap();
    assert_eq!(second, "");
}

#[test]
fn stderr_contributes_to_the_response() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path());
    let out = tempfile::tempdir().unwrap();

    let mut server = FuzzServer::bootstrap(server_config(
        dir.path(),
        out.path(),
        MatcherSelect::Cdbi,
    ))
    .unwrap();

    write_response(out.path(), b"", b"parse error: truncated input\n");
    server.process_request().unwrap();
    let edges = fs::read_to_string(out.path().join(EDGES_FILE)).unwrap();
    assert_eq!(edges, "3\n");
}

#[test]
fn similarity_matcher_serves_the_same_protocol() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path());
    let out = tempfile::tempdir().unwrap();

    let mut server = FuzzServer::bootstrap(server_config(
        dir.path(),
        out.path(),
        MatcherSelect::SimilarityLow,
    ))
    .unwrap();

    write_response(out.path(), b"parse error: bad magic\n", b"");
    server.process_request().unwrap();
    let edges = fs::read_to_string(out.path().join(EDGES_FILE)).unwrap();
    assert_eq!(edges, "3\n");
}

#[test]
fn max_lines_keeps_only_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    write_artifact(dir.path());
    let out = tempfile::tempdir().unwrap();

    let mut config = server_config(dir.path(), out.path(), MatcherSelect::Cdbi);
    config.max_lines = 2;
    let mut server = FuzzServer::bootstrap(config).unwrap();

    // The interesting line scrolls out of the 2-line tail.
    let mut stdout = b"fuzz target started\n".to_vec();
    for i in 0..10 {
        stdout.extend_from_slice(format!("filler {i}\n").as_bytes());
    }
    write_response(out.path(), &stdout, b"");
    server.process_request().unwrap();
    let edges = fs::read_to_string(out.path().join(EDGES_FILE)).unwrap();
    assert_eq!(edges, "");
}

#[test]
fn missing_artifact_fails_at_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let err = FuzzServer::bootstrap(server_config(
        dir.path(),
        out.path(),
        MatcherSelect::Cdbi,
    ));
    assert!(err.is_err());
}
