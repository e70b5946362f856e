// src/error.rs

//! Error taxonomy for the patch orchestration core
//!
//! Adapter-level failures are not part of this enum: adapters return
//! structured outcomes (`managers::AdapterError`) and the orchestrator
//! converts them into patch-row results or a run-level terminal state.
//! The variants here are the ones that cross module boundaries.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Request was malformed or failed validation at ingest
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No package manager adapter matches this distribution
    #[error("Unsupported distribution: {0}")]
    UnsupportedDistro(String),

    /// The host-provided environment descriptor is missing or unusable
    #[error("Environment error: {0}")]
    Environment(String),

    /// The package manager is in a state that cannot be recovered from
    /// within this run (corrupt cache, interrupted dpkg, missing binary)
    #[error("Package manager fatal: {0}")]
    PackageManagerFatal(String),

    /// The maintenance window was exhausted
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The run was cancelled by SIGTERM or a superseding NoOperation
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Status document could not be written (retried before surfacing)
    #[error("Status write error: {0}")]
    StatusWrite(String),

    /// Reboot did not proceed as requested
    #[error("Reboot failure: {0}")]
    RebootFailure(String),

    /// Another orchestrator instance holds the execute-phase lock
    #[error("Another patch operation is in progress: {0}")]
    AlreadyRunning(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the run should be sealed as `Aborted` rather than `Failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}
