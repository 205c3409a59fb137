//! Feature modules, leaf-first.

/// Static-analysis artifact loading
pub mod artifact;

/// Call graph, SCCs, function distances
pub mod call_graph;

/// CFG minimization passes
pub mod transform;

/// Aho–Corasick automata
pub mod aho_corasick;

/// Gap-aware sequence matching
pub mod seq_match;

/// Literal-to-block matching and CDBI
pub mod block_match;

/// Fuzzer request loop
pub mod server;
