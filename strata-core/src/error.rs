//! Error types for Strata

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Node has no metadata file
    #[error("Metadata not found for node {0}")]
    MetadataNotFound(String),

    /// Node metadata could not be parsed or failed validation
    #[error("Malformed metadata for node {node}: {reason}")]
    MalformedMetadata { node: String, reason: String },

    /// Requested range holds no points
    #[error("No data in requested range")]
    NoData,

    /// Write would pad more absent points than allowed
    #[error("Slice gap too large: {gap} points (max {max})")]
    SliceGapTooLarge { gap: u64, max: u64 },

    /// Slice was removed underneath us
    #[error("Slice deleted")]
    SliceDeleted,

    /// Request does not make sense for the slice it targets
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Path is not inside a storage tree
    #[error("{0:?} is not a storage tree root")]
    NotATree(PathBuf),

    /// Run lock was held by someone else for too long
    #[error("Failed to acquire lock {path:?} within {secs}s")]
    LockTimeout { path: PathBuf, secs: u64 },

    /// Run lock could not be taken for a reason other than contention
    #[error("Lock error: {0}")]
    Lock(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Errors that only alter control flow inside a node's run
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StrataError::NoData | StrataError::SliceGapTooLarge { .. } | StrataError::SliceDeleted
        )
    }

    /// Errors that abort the current node but not the batch
    pub fn is_node_fatal(&self) -> bool {
        !self.is_recoverable() && !self.is_run_fatal()
    }

    /// Errors that abort the whole run
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            StrataError::LockTimeout { .. } | StrataError::Lock(_) | StrataError::NotATree(_)
        )
    }
}
