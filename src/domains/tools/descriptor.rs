//! Invocable tool descriptors.

use std::fmt;
use std::sync::Arc;

use rmcp::model::Tool;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use super::error::ToolError;
use super::schema::ParamSchema;
use crate::domains::connections::ConnectionManager;

/// Separator between server name and tool name in a qualified name.
pub const QUALIFIER: char = '/';

/// Build the gateway-wide name of a downstream tool.
pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("{server}{QUALIFIER}{tool}")
}

/// One downstream tool as exposed by the gateway.
///
/// A descriptor holds the connection pool rather than a connection, so every
/// invocation picks up whatever connection is current for its server.
#[derive(Clone)]
pub struct ToolDescriptor {
    qualified_name: String,
    server: String,
    tool: String,
    description: String,
    parameters: ParamSchema,
    connections: ConnectionManager,
}

impl ToolDescriptor {
    /// Create a descriptor for `tool` on `server`.
    pub fn new(
        server: impl Into<String>,
        tool: impl Into<String>,
        description: impl Into<String>,
        parameters: ParamSchema,
        connections: ConnectionManager,
    ) -> Self {
        let server = server.into();
        let tool = tool.into();
        Self {
            qualified_name: qualified_name(&server, &tool),
            server,
            tool,
            description: description.into(),
            parameters,
            connections,
        }
    }

    /// `server/tool`.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Owning server.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Tool name as known downstream.
    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &ParamSchema {
        &self.parameters
    }

    /// MCP tool model advertised to gateway clients.
    pub fn to_tool(&self) -> Tool {
        Tool {
            name: self.qualified_name.clone().into(),
            description: Some(self.description.clone().into()),
            input_schema: Arc::new(self.parameters.to_input_schema()),
            annotations: None,
            output_schema: None,
            icons: None,
            meta: None,
            title: None,
        }
    }

    /// Validate `arguments`, then call the tool downstream.
    ///
    /// Missing arguments mean an empty object. If the pooled connection turns
    /// out to be dead before the request is written, the call is retried once
    /// on a fresh connection. A connection lost after the write is reported to
    /// the caller, since the downstream may already have run the tool.
    #[instrument(skip(self, arguments), fields(tool = %self.qualified_name))]
    pub async fn invoke(&self, arguments: Option<Value>) -> Result<Value, ToolError> {
        let arguments = match arguments {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(args @ Value::Object(_)) => args,
            Some(_) => {
                return Err(ToolError::invalid_arguments(
                    &self.qualified_name,
                    "arguments must be a JSON object",
                ));
            }
        };

        self.parameters
            .validate(&arguments)
            .map_err(|e| ToolError::invalid_arguments(&self.qualified_name, e.to_string()))?;

        let mut retried = false;
        loop {
            let connection = self
                .connections
                .acquire(&self.server)
                .await
                .map_err(|e| ToolError::from_connection(&self.qualified_name, e))?;

            match connection.client().call_tool(&self.tool, arguments.clone()).await {
                Ok(result) => {
                    debug!("{} answered", self.qualified_name);
                    return Ok(result);
                }
                Err(err) if err.is_undelivered() && !retried => {
                    warn!("Connection to {} was dead before the call, retrying once: {}", self.server, err);
                    self.connections.invalidate(&connection).await;
                    retried = true;
                }
                Err(err) => {
                    if err.is_connection_lost() {
                        self.connections.invalidate(&connection).await;
                    }
                    return Err(ToolError::from_connection(&self.qualified_name, err));
                }
            }
        }
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("qualified_name", &self.qualified_name)
            .field("description", &self.description)
            .finish()
    }
}
