//! Directory error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for directory lookups.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Errors raised by the process directory or configuration store.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// No server with this name is known.
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    /// The manifest file could not be read.
    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest file is not valid.
    #[error("Failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An entry exists but cannot be launched as declared.
    #[error("Invalid launch parameters for {server}: {reason}")]
    InvalidEntry { server: String, reason: String },

    /// The directory did not answer in time.
    #[error("Directory did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

impl DirectoryError {
    /// Create an unknown-server error.
    pub fn unknown(name: impl Into<String>) -> Self {
        Self::UnknownServer(name.into())
    }

    /// Create an invalid-entry error.
    pub fn invalid(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEntry {
            server: server.into(),
            reason: reason.into(),
        }
    }
}
