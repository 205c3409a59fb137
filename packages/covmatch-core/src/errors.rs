//! Error types for covmatch-core.
//!
//! Configuration and artifact problems fail fast at startup; corrupt graph
//! invariants abort through the transformer's verification hooks rather
//! than surfacing here. A silently wrong coverage vector is worse than a
//! crash, so only matcher-local pattern failures are recovered in place.

use thiserror::Error;

/// Main error type for covmatch operations.
#[derive(Debug, Error)]
pub enum CovmatchError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Static-analysis artifact could not be parsed
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Configuration error (env vars, CLI)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire protocol failure towards the fuzzer
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl CovmatchError {
    /// Create an artifact error
    pub fn artifact(msg: impl Into<String>) -> Self {
        CovmatchError::Artifact(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        CovmatchError::Config(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        CovmatchError::Protocol(msg.into())
    }
}

/// Result type alias for covmatch operations.
pub type Result<T> = std::result::Result<T, CovmatchError>;
