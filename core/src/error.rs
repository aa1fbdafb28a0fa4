//! Error taxonomy for capmaster-core.
//!
//! Mirrors the kinds from spec.md §7: system errors (dissector missing,
//! timeouts, OS failures) are never recovered locally and always surface;
//! per-line and per-stream parse errors are logged and skipped by their
//! callers, never by this module.

use std::path::PathBuf;

use thiserror::Error;

/// Failures from invoking or negotiating with the external dissector.
#[derive(Debug, Error)]
pub enum DissectorError {
    #[error("dissector executable not found (checked override and PATH): {0}")]
    NotFound(String),

    #[error("dissector version {found} is below the required floor {floor}")]
    VersionMismatch { found: String, floor: String },

    #[error("dissector exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("dissector timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to spawn dissector process")]
    Spawn(#[source] std::io::Error),
}

/// Failures reconstructing a single TCP stream into a `Connection`.
///
/// Callers of `ConnectionExtractor` treat these as recoverable: log at
/// warn and drop the offending stream, per spec.md §7.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("stream {0} has no observed packets")]
    EmptyStream(u32),

    #[error("stream {0} has no IP-ID observations and is dropped")]
    NoIpIds(u32),
}

/// Top-level error type surfaced to callers of capmaster-core.
#[derive(Debug, Error)]
pub enum CapMasterError {
    #[error(transparent)]
    Dissector(#[from] DissectorError),

    #[error("I/O error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run was cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CapMasterError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CapMasterError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CapMasterError>;
