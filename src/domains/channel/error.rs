//! Channel error types.

use thiserror::Error;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors raised by a downstream message channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The socket (or child process) could not be reached.
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The connection attempt did not finish in time.
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    /// The channel was closed or destroyed before the write started.
    #[error("Channel is not writable")]
    NotWritable,

    /// The remote end went away mid-write (broken pipe / reset).
    #[error("Connection broken: {0}")]
    ConnectionBroken(String),

    /// The write did not complete in time; the peer is not draining its input.
    #[error("Write stalled for more than {0}ms")]
    WriteStalled(u64),

    /// Any other I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The outgoing message could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChannelError {
    /// Create a connect error.
    pub fn connect(address: impl Into<String>, source: std::io::Error) -> Self {
        Self::Connect {
            address: address.into(),
            source,
        }
    }

    /// Classify a failed write: a broken pipe is reported as a broken
    /// connection, everything else as plain I/O.
    pub fn from_write(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                Self::ConnectionBroken(err.to_string())
            }
            _ => Self::Io(err),
        }
    }

    /// Whether a fresh connection is the right way to recover.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::NotWritable | Self::ConnectionBroken(_) | Self::WriteStalled(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_broken_pipe_is_distinct() {
        let err = ChannelError::from_write(Error::new(ErrorKind::BrokenPipe, "pipe"));
        assert!(matches!(err, ChannelError::ConnectionBroken(_)));
        assert!(err.is_connection_lost());
    }

    #[test]
    fn test_other_write_errors_are_io() {
        let err = ChannelError::from_write(Error::new(ErrorKind::PermissionDenied, "nope"));
        assert!(matches!(err, ChannelError::Io(_)));
        assert!(!err.is_connection_lost());
    }

    #[test]
    fn test_connect_error_display() {
        let err = ChannelError::connect(
            "/tmp/x.sock",
            Error::new(ErrorKind::NotFound, "no such file"),
        );
        assert!(err.to_string().contains("/tmp/x.sock"));
    }
}
