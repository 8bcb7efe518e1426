//! Errors surfaced to control-plane callers.
//!
//! Everything that stays inside a worker (pipeline failures, persistence
//! failures, vision timeouts) travels as `anyhow::Error` and is logged where it
//! is absorbed. Only the two categories a caller can act on get typed enums.

use thiserror::Error;

/// Failures of the source registry.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No transport (and no fallback) could open the source.
    #[error("source '{id}' unavailable: {reason}")]
    Unavailable { id: String, reason: String },

    /// A single read failed. The worker retries these.
    #[error("read error on source '{id}': {reason}")]
    Read { id: String, reason: String },

    /// The consecutive error threshold was reached. Reads short-circuit until
    /// the source is released and acquired again.
    #[error("source '{id}' terminally failed after {errors} consecutive read errors")]
    Terminal { id: String, errors: u32 },

    /// No handle is registered under this id (never acquired, or released).
    #[error("source '{0}' is not acquired")]
    NotAcquired(String),

    #[error("invalid source id '{0}'")]
    InvalidId(String),
}

/// Rejected control requests. None of these are fatal to the caller.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("pipeline '{pipeline_id}' already running on source '{source_id}'")]
    AlreadyRunning {
        source_id: String,
        pipeline_id: String,
    },

    #[error("no pipeline '{pipeline_id}' running on source '{source_id}'")]
    NotRunning {
        source_id: String,
        pipeline_id: String,
    },

    #[error("source '{0}' not found")]
    SourceNotFound(String),

    #[error("pipeline '{0}' not found")]
    PipelineNotFound(String),

    #[error(transparent)]
    SourceUnavailable(#[from] SourceError),

    #[error("failed to launch worker: {0}")]
    Spawn(String),

    #[error(transparent)]
    Lookup(#[from] anyhow::Error),
}

impl SourceError {
    /// True for the categories the registry will never recover from on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceError::Terminal { .. })
    }
}
