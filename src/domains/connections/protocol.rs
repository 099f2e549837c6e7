//! JSON-RPC 2.0 message types spoken to downstream servers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision the gateway negotiates downstream.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request.
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification (no id, no reply).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// What an inbound message turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to one of our requests.
    Response {
        id: u64,
        outcome: Result<Value, JsonRpcError>,
    },
    /// A request initiated by the downstream server.
    Request { id: Value, method: String },
    /// A notification from the downstream server.
    Notification { method: String },
    /// Valid JSON that is not a JSON-RPC message we understand.
    Unknown,
}

impl Inbound {
    /// Classify a raw inbound message.
    pub fn classify(message: Value) -> Self {
        let Value::Object(mut map) = message else {
            return Self::Unknown;
        };

        if let Some(Value::String(method)) = map.remove("method") {
            return match map.remove("id") {
                Some(id) if !id.is_null() => Self::Request { id, method },
                _ => Self::Notification { method },
            };
        }

        let Some(id) = map.get("id").and_then(Value::as_u64) else {
            return Self::Unknown;
        };

        if let Some(error) = map.remove("error") {
            let error = serde_json::from_value(error).unwrap_or_else(|_| JsonRpcError {
                code: -32603,
                message: "malformed error object".to_string(),
                data: None,
            });
            return Self::Response {
                id,
                outcome: Err(error),
            };
        }

        Self::Response {
            id,
            outcome: Ok(map.remove("result").unwrap_or(Value::Null)),
        }
    }
}

/// A tool as advertised by a downstream `tools/list` reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
}
