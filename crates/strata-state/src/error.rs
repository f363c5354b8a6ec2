//! State error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors raised while loading or saving provisioning state.
#[derive(Debug, Error)]
pub enum StateError {
    /// Underlying storage failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored state could not be decoded.
    #[error("corrupt state at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}
