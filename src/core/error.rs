//! Error types and handling for the gateway.
//!
//! Domain errors stay typed inside their domains and surface to MCP clients
//! as call failures. This type covers what can stop the gateway itself:
//! bad configuration and a failing outward transport.

use thiserror::Error;

/// A specialized Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the gateway.
#[derive(Debug, Error)]
pub enum Error {
    /// Error from an outward transport.
    #[error("Transport error: {0}")]
    Transport(#[from] super::transport::TransportError),

    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::TransportError;

    #[test]
    fn test_transport_errors_convert() {
        let err: Error = TransportError::init("no session").into();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.to_string().starts_with("Transport error"));
    }
}
