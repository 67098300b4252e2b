//! Error taxonomy for the synchronization engine
//!
//! Two layers of errors live here:
//!
//! - [`DomainError`] — validation failures raised when constructing domain
//!   newtypes (invalid paths, malformed identifiers).
//! - [`EngineError`] — the run-level taxonomy observed by callers of the
//!   coordinator. Per-item failures are captured into the sync report and do
//!   not surface as `EngineError`; only conditions that abort a run do.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised when constructing or manipulating domain values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid local path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Path is not within the configured sync root
    #[error("Path not within sync root: {0}")]
    PathNotInSyncRoot(String),

    /// Invalid remote path format
    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    /// Invalid drive or item identifier
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// Invalid delta link
    #[error("Invalid delta link: {0}")]
    InvalidDeltaLink(String),

    /// Invalid content hash representation
    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Run-level errors of the synchronization engine
///
/// Everything that can halt a run. Per-item conditions (a file that cannot
/// be read, a hash that refuses to verify) are recorded in the
/// [`SyncReport`](super::report::SyncReport) instead and leave the run alive.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport-level failure that outlived all retries
    #[error("Transient failure exhausted retries: {0}")]
    Transient(String),

    /// Token refresh failed twice in a row; reauthorization required
    #[error("Authorization expired; run the login flow again")]
    AuthExpired,

    /// The item database schema is newer than this binary understands
    #[error("Database schema version {found} is not supported (max {supported})")]
    SchemaIncompatible {
        /// Version found in the database
        found: i64,
        /// Highest version this binary can migrate to
        supported: i64,
    },

    /// The configuration failed validation at startup
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The configured sync root does not exist or is not a directory
    #[error("Sync root missing or not a directory: {0}")]
    SyncRootMissing(PathBuf),

    /// The run was cancelled through the cancellation token
    #[error("Sync cancelled")]
    Cancelled,

    /// A delta page would introduce a parent/child cycle
    #[error("Remote change feed would create a cycle at item {0}")]
    CycleDetected(String),

    /// Wrapper for adapter errors that abort the run
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Returns true if the condition is fatal at startup (nothing was synced)
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::SchemaIncompatible { .. }
                | EngineError::ConfigInvalid(_)
                | EngineError::SyncRootMissing(_)
        )
    }
}
