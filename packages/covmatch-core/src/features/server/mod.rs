//! Fuzzer-facing request loop.
//!
//! Startup: load the artifact, run the minimization passes, freeze the
//! graph, solve dominators, build the distance map. Then serve strictly
//! sequential requests: a 4-byte read on FD 88 announces that
//! `stdout.txt`/`stderr.txt` hold a fresh execution's output; the inferred
//! coverage goes to `edges.txt` (one hex vertex index per line) and 4 bytes
//! `DONE` on FD 89 release the fuzzer. Any failure inside a request cycle
//! means the fuzzer is gone: the union of all vertices ever emitted is
//! flushed to `all_vertices.txt` and the server exits cleanly.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::os::unix::io::FromRawFd;

use rustc_hash::{FxHashMap, FxHashSet};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::errors::{CovmatchError, Result};
use crate::features::artifact::{self, StaticAnalysis};
use crate::features::block_match::similarity::SimilarityMatcher;
use crate::features::block_match::{split_lines_keepends, BlockMatcher};
use crate::features::call_graph::FuncDistanceMap;
use crate::features::transform::CfgTransformer;
use crate::shared::models::Cfg;

/// Descriptor the fuzzer signals requests on.
pub const REQUEST_FD: i32 = 88;
/// Descriptor the server acknowledges on.
pub const RESPONSE_FD: i32 = 89;

pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const EDGES_FILE: &str = "edges.txt";
pub const ALL_VERTICES_FILE: &str = "all_vertices.txt";
pub const DONE_TOKEN: &[u8; 4] = b"DONE";

enum Matcher {
    Cdbi(BlockMatcher),
    Similarity(SimilarityMatcher),
}

/// The long-running coverage server.
pub struct FuzzServer {
    config: ServerConfig,
    cfg: Cfg,
    distances: FuncDistanceMap,
    matcher: Matcher,
    vertex_index: FxHashMap<u64, usize>,
    /// SHA-256 digests of every response processed in this session.
    seen_hashes: FxHashSet<[u8; 32]>,
    /// Union of all vertex addresses ever emitted.
    seen_vertices: BTreeSet<u64>,
}

impl FuzzServer {
    /// Load the artifact and build every derived structure. Fails fast on
    /// missing or malformed inputs.
    pub fn bootstrap(config: ServerConfig) -> Result<Self> {
        let StaticAnalysis {
            mut cfg,
            vertex_index,
            ..
        } = artifact::load(&config.static_analysis_dir)?;

        let mut transformer = CfgTransformer::new();
        transformer.run_all_passes(&mut cfg);
        cfg.build_dominators();
        let distances = FuncDistanceMap::build(&cfg);

        let matcher = match config.matcher.similarity_threshold() {
            None => Matcher::Cdbi(BlockMatcher::new(&cfg, config.line_cache_capacity)),
            Some(threshold) => {
                Matcher::Similarity(SimilarityMatcher::new(threshold, config.line_cache_capacity))
            }
        };

        info!(
            funcs = cfg.num_funcs(),
            blocks = cfg.num_blocks(),
            edges = cfg.num_edges(),
            "minimization fixpoint reached; server warming up"
        );

        Ok(Self {
            config,
            cfg,
            distances,
            matcher,
            vertex_index,
            seen_hashes: FxHashSet::default(),
            seen_vertices: BTreeSet::new(),
        })
    }

    /// Read both response files, dropping consecutive duplicate lines, and
    /// keep the configured tail of the combined line list.
    fn load_response(&self) -> Result<Vec<u8>> {
        let mut lines: Vec<Vec<u8>> = Vec::new();
        for name in [STDOUT_FILE, STDERR_FILE] {
            let bytes = fs::read(self.config.out_dir.join(name))?;
            let mut prev: Option<&[u8]> = None;
            for line in split_lines_keepends(&bytes) {
                if prev != Some(line) {
                    lines.push(line.to_vec());
                }
                prev = Some(line);
            }
        }
        let tail_start = lines.len().saturating_sub(self.config.max_lines);
        Ok(lines[tail_start..].concat())
    }

    fn write_vertices(&mut self, addrs: &BTreeSet<u64>) -> Result<()> {
        let path = self.config.out_dir.join(EDGES_FILE);
        let mut out = BufWriter::new(File::create(&path)?);
        for &addr in addrs {
            let idx = self.vertex_index.get(&addr).ok_or_else(|| {
                CovmatchError::protocol(format!("block {addr:#x} has no vertex index"))
            })?;
            writeln!(out, "{idx:x}")?;
            self.seen_vertices.insert(addr);
        }
        out.flush()?;
        Ok(())
    }

    /// Serve one request from the response files already on disk.
    pub fn process_request(&mut self) -> Result<()> {
        let response = self.load_response()?;
        let digest: [u8; 32] = Sha256::digest(&response).into();
        if !self.seen_hashes.insert(digest) {
            debug!("duplicate response hash; emitting empty coverage");
            return self.write_vertices(&BTreeSet::new());
        }

        let blocks = match &mut self.matcher {
            Matcher::Cdbi(matcher) => matcher.search_blocks(&self.cfg, &self.distances, &response),
            Matcher::Similarity(matcher) => matcher.search_blocks(&self.cfg, &response),
        };
        let addrs: BTreeSet<u64> = blocks
            .iter()
            .map(|&b| self.cfg.block(b).start_addr)
            .collect();
        debug!(blocks = addrs.len(), bytes = response.len(), "request served");
        self.write_vertices(&addrs)
    }

    /// Flush the union of every vertex address ever emitted.
    fn save_all_vertices(&self) -> Result<()> {
        let path = self.config.out_dir.join(ALL_VERTICES_FILE);
        let mut out = BufWriter::new(File::create(&path)?);
        for &addr in &self.seen_vertices {
            writeln!(out, "{addr:x}")?;
        }
        out.flush()?;
        Ok(())
    }

    fn serve_one(&mut self, request: &mut File, response: &mut File) -> Result<()> {
        let mut signal = [0u8; 4];
        let n = request.read(&mut signal)?;
        if n == 0 {
            return Err(CovmatchError::protocol("request descriptor closed"));
        }
        self.process_request()?;
        response.write_all(DONE_TOKEN)?;
        Ok(())
    }

    /// Blocking request loop over the two inherited descriptors. Returns
    /// `Ok(())` on fuzzer detach (the graceful exit path).
    pub fn run(&mut self) -> Result<()> {
        // The descriptors are part of the wire protocol and are inherited
        // from the fuzzer harness; the File wrappers own them for the
        // lifetime of the loop.
        let mut request = unsafe { File::from_raw_fd(REQUEST_FD) };
        let mut response = unsafe { File::from_raw_fd(RESPONSE_FD) };

        let mut count: u64 = 0;
        loop {
            count += 1;
            info!(count, "server ready");
            if let Err(err) = self.serve_one(&mut request, &mut response) {
                warn!(%err, "fuzzer stopped; flushing observed vertices");
                self.save_all_vertices()?;
                return Ok(());
            }
        }
    }

    /// One-shot mode: serve a single request from the files on disk and
    /// return, without touching the descriptors.
    pub fn run_oneshot(&mut self) -> Result<()> {
        self.process_request()
    }

    pub fn cfg(&self) -> &Cfg {
        &self.cfg
    }
}
