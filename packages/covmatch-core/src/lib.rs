/*
 * covmatch-core - coverage inference for greybox fuzzing feedback
 *
 * Given the recovered whole-program CFG of a target binary and the textual
 * output of one execution, infer the basic blocks the execution most likely
 * traversed - without instrumenting the target.
 *
 * Pipeline per fuzz input:
 *   raw output -> line split + dedup -> ordered literal matches per line
 *   -> block resolution over the minimized CFG (call-graph distances break
 *   ties) -> vertex indices handed back to the fuzzer.
 */

/// Shared graph models (arenas, blocks, functions, xrefs, dominators)
pub mod shared;

/// Feature modules (loading, minimization, matching, serving)
pub mod features;

/// Server configuration
pub mod config;

/// Error types
pub mod errors;

pub use errors::{CovmatchError, Result};
