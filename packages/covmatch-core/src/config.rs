//! Server configuration.
//!
//! The fuzzer side of the protocol configures the core exclusively through
//! environment variables; the server binary additionally accepts CLI
//! overrides for local runs against captured output.

use std::env;
use std::path::PathBuf;

use crate::errors::{CovmatchError, Result};

/// Required: directory holding the static-analysis artifact.
pub const ENV_STATIC_ANALYSIS_PATH: &str = "FUZZ_STATIC_ANALYSIS_PATH";
/// Required: directory shared with the fuzzer for request/response files.
pub const ENV_OUT_DIR_PATH: &str = "FUZZ_OUT_DIR_PATH";
/// Optional: tail length applied to the deduplicated response lines.
pub const ENV_MAX_LINES: &str = "FUZZ_MAX_LINES";
/// Optional: select the similarity baseline with threshold 0.35.
pub const ENV_USE_LABRADOR_LOW: &str = "FUZZ_USE_LABRADOR_LOW";
/// Optional: select the similarity baseline with threshold 0.70.
pub const ENV_USE_LABRADOR_HIGH: &str = "FUZZ_USE_LABRADOR_HIGH";
/// Optional: serve a single request and exit instead of looping.
pub const ENV_NOT_START_SERVER: &str = "FUZZ_NOT_START_SERVER";
/// Optional: bound the line-level match cache (LRU). Unbounded when absent.
pub const ENV_LINE_CACHE_CAPACITY: &str = "FUZZ_LINE_CACHE_CAPACITY";

pub const DEFAULT_MAX_LINES: usize = 5000;

/// Which matcher answers coverage queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherSelect {
    /// Sequence matcher + context-driven block identification (default).
    Cdbi,
    /// Similarity baseline, threshold 0.35.
    SimilarityLow,
    /// Similarity baseline, threshold 0.70.
    SimilarityHigh,
}

impl MatcherSelect {
    pub fn similarity_threshold(self) -> Option<f64> {
        match self {
            MatcherSelect::Cdbi => None,
            MatcherSelect::SimilarityLow => Some(0.35),
            MatcherSelect::SimilarityHigh => Some(0.70),
        }
    }
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub static_analysis_dir: PathBuf,
    pub out_dir: PathBuf,
    pub max_lines: usize,
    pub matcher: MatcherSelect,
    /// Serve one request and exit.
    pub oneshot: bool,
    /// Line-cache bound; `None` means unbounded.
    pub line_cache_capacity: Option<usize>,
}

impl ServerConfig {
    /// Read the configuration from the environment, failing fast on missing
    /// or contradictory settings.
    pub fn from_env() -> Result<Self> {
        let static_analysis_dir = require_env(ENV_STATIC_ANALYSIS_PATH)?;
        let out_dir = require_env(ENV_OUT_DIR_PATH)?;

        let max_lines = match env::var(ENV_MAX_LINES) {
            Ok(v) => v.parse::<usize>().map_err(|_| {
                CovmatchError::config(format!("{ENV_MAX_LINES} must be an unsigned integer, got {v:?}"))
            })?,
            Err(_) => DEFAULT_MAX_LINES,
        };

        let low = env::var_os(ENV_USE_LABRADOR_LOW).is_some();
        let high = env::var_os(ENV_USE_LABRADOR_HIGH).is_some();
        let matcher = match (low, high) {
            (true, true) => {
                return Err(CovmatchError::config(format!(
                    "{ENV_USE_LABRADOR_LOW} and {ENV_USE_LABRADOR_HIGH} are mutually exclusive"
                )))
            }
            (true, false) => MatcherSelect::SimilarityLow,
            (false, true) => MatcherSelect::SimilarityHigh,
            (false, false) => MatcherSelect::Cdbi,
        };

        let line_cache_capacity = match env::var(ENV_LINE_CACHE_CAPACITY) {
            Ok(v) => Some(v.parse::<usize>().map_err(|_| {
                CovmatchError::config(format!(
                    "{ENV_LINE_CACHE_CAPACITY} must be an unsigned integer, got {v:?}"
                ))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            static_analysis_dir: PathBuf::from(static_analysis_dir),
            out_dir: PathBuf::from(out_dir),
            max_lines,
            matcher,
            oneshot: env::var_os(ENV_NOT_START_SERVER).is_some(),
            line_cache_capacity,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| CovmatchError::config(format!("{name} is not set")))
}
