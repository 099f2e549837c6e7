//! Connection error types.

use thiserror::Error;

use crate::domains::channel::ChannelError;
use crate::domains::directory::DirectoryError;

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors raised while acquiring or using a downstream connection.
///
/// Cloneable, so one in-flight acquisition can hand the same outcome to
/// every task waiting on it.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The directory does not report the server as online.
    #[error("Server not running: {0}")]
    ServerNotRunning(String),

    /// The connection could not be established.
    #[error("Failed to connect to {server}: {message}")]
    Connect { server: String, message: String },

    /// An established connection died mid-use.
    #[error("Connection to {server} broken: {message}")]
    ConnectionBroken { server: String, message: String },

    /// The connection was unusable before the request could be written, so
    /// the server never saw it.
    #[error("Request to {server} not delivered: {message}")]
    Undelivered { server: String, message: String },

    /// An operation did not finish in time.
    #[error("Timed out during {operation} for {server}")]
    Timeout {
        server: String,
        operation: &'static str,
    },

    /// The directory or configuration store failed.
    #[error("Directory lookup for {server} failed: {message}")]
    Directory { server: String, message: String },

    /// The server sent something we could not make sense of.
    #[error("Protocol error from {server}: {message}")]
    Protocol { server: String, message: String },

    /// The server answered with a JSON-RPC error.
    #[error("{server} returned error {code}: {message}")]
    Remote {
        server: String,
        code: i64,
        message: String,
    },

    /// The connection was released while it was still being established.
    #[error("Connection to {0} was released while connecting")]
    Released(String),
}

impl ConnectionError {
    /// Create a protocol error.
    pub fn protocol(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a broken-connection error.
    pub fn broken(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionBroken {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create an error for a request that never reached the wire.
    pub fn undelivered(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Undelivered {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(server: impl Into<String>, operation: &'static str) -> Self {
        Self::Timeout {
            server: server.into(),
            operation,
        }
    }

    /// Wrap a directory failure.
    pub fn directory(server: impl Into<String>, err: &DirectoryError) -> Self {
        Self::Directory {
            server: server.into(),
            message: err.to_string(),
        }
    }

    /// Wrap a channel failure.
    pub fn from_channel(server: impl Into<String>, err: &ChannelError) -> Self {
        let server = server.into();
        let message = err.to_string();
        match err {
            ChannelError::Connect { .. } | ChannelError::ConnectTimeout(_) => {
                Self::Connect { server, message }
            }
            ChannelError::NotWritable
            | ChannelError::ConnectionBroken(_)
            | ChannelError::WriteStalled(_)
            | ChannelError::Io(_) => Self::ConnectionBroken { server, message },
            ChannelError::Json(_) => Self::Protocol { server, message },
        }
    }

    /// Whether the connection this came from is dead.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionBroken { .. } | Self::Undelivered { .. })
    }

    /// Whether the request can safely be sent again on a fresh connection.
    ///
    /// Only true when the server cannot have seen the request.
    pub fn is_undelivered(&self) -> bool {
        matches!(self, Self::Undelivered { .. })
    }
}
