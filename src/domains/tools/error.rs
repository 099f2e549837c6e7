//! Tool-specific error types.

use serde::Serialize;
use thiserror::Error;

use crate::domains::connections::ConnectionError;

/// JSON-RPC code downstream servers use for rejected arguments.
const INVALID_PARAMS: i64 = -32602;

/// Errors raised while translating a parameter schema or validating
/// arguments against one.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    /// The declared schema could not be understood.
    #[error("Malformed schema at {path}: {reason}")]
    Malformed { path: String, reason: String },

    /// A value does not satisfy the schema.
    #[error("Invalid value at {path}: {reason}")]
    Violation { path: String, reason: String },
}

impl SchemaError {
    /// Create a "malformed schema" error.
    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a "validation failed" error.
    pub fn violation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Violation {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Who is to blame for a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Fault {
    /// Unknown tool or bad arguments.
    Client,
    /// The downstream server is unreachable or failed.
    Service,
}

/// Errors that can occur while routing or invoking a tool.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// The requested tool is not in the live registry.
    #[error("Tool not found: {name}")]
    NotFound { name: String, known: Vec<String> },

    /// The arguments failed validation or were rejected downstream.
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// No usable connection to the owning server.
    #[error("Downstream server for {tool} is unreachable: {source}")]
    DownstreamUnreachable {
        tool: String,
        #[source]
        source: ConnectionError,
    },

    /// The downstream tool reported a failure.
    #[error("{tool} failed: {message}")]
    DownstreamInvocation {
        tool: String,
        code: Option<i64>,
        message: String,
    },
}

impl ToolError {
    /// Create a "not found" error carrying the currently known names.
    pub fn not_found(name: impl Into<String>, known: Vec<String>) -> Self {
        Self::NotFound {
            name: name.into(),
            known,
        }
    }

    /// Create an "invalid arguments" error.
    pub fn invalid_arguments(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a connection-level failure for `tool`.
    pub fn from_connection(tool: impl Into<String>, err: ConnectionError) -> Self {
        let tool = tool.into();
        match err {
            ConnectionError::Remote { code, message, .. } if code == INVALID_PARAMS => {
                Self::InvalidArguments {
                    tool,
                    reason: message,
                }
            }
            ConnectionError::Remote { code, message, .. } => Self::DownstreamInvocation {
                tool,
                code: Some(code),
                message,
            },
            ConnectionError::Protocol { message, .. } => Self::DownstreamInvocation {
                tool,
                code: None,
                message,
            },
            source => Self::DownstreamUnreachable { tool, source },
        }
    }

    /// Client-fault or service-fault.
    pub fn fault(&self) -> Fault {
        match self {
            Self::NotFound { .. } | Self::InvalidArguments { .. } => Fault::Client,
            Self::DownstreamUnreachable { .. } | Self::DownstreamInvocation { .. } => Fault::Service,
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "tool_not_found",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::DownstreamUnreachable { .. } => "downstream_unreachable",
            Self::DownstreamInvocation { .. } => "downstream_invocation",
        }
    }

    /// Structured failure object handed to boundary layers.
    pub fn to_failure(&self) -> CallFailure {
        let (tool, known_tools) = match self {
            Self::NotFound { name, known } => (name.clone(), Some(known.clone())),
            Self::InvalidArguments { tool, .. }
            | Self::DownstreamUnreachable { tool, .. }
            | Self::DownstreamInvocation { tool, .. } => (tool.clone(), None),
        };
        CallFailure {
            fault: self.fault(),
            kind: self.kind(),
            tool,
            message: self.to_string(),
            known_tools,
        }
    }
}

/// A failed call as reported to whoever asked for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFailure {
    pub fault: Fault,
    pub kind: &'static str,
    pub tool: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_tools: Option<Vec<String>>,
}
