//! MCP server handler for the gateway's own clients.
//!
//! Tool listing and invocation are answered from the live registry through a
//! [`CallRouter`]. Every outward transport (stdio, TCP, HTTP) goes through
//! this type, so they all see the same tools.

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::*,
    service::{NotificationContext, RequestContext},
};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::gateway::Gateway;
use crate::domains::registry::RegistryStatus;
use crate::domains::tools::{CallRouter, Fault, ToolError};

pub(crate) const INSTRUCTIONS: &str = "This gateway exposes the tools of every running downstream MCP server. \
     Tool names are qualified as <server>/<tool>.";

/// The gateway's MCP server handler.
#[derive(Clone)]
pub struct GatewayServer {
    gateway: Gateway,
    router: CallRouter,
}

impl GatewayServer {
    /// Create a handler serving `gateway`'s live registry.
    pub fn new(gateway: Gateway) -> Self {
        let router = gateway.router();
        Self { gateway, router }
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        self.gateway.name()
    }

    /// Get the server version.
    pub fn version(&self) -> &str {
        self.gateway.version()
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// A router over the live registry.
    pub fn router(&self) -> CallRouter {
        self.router.clone()
    }

    pub async fn status(&self) -> RegistryStatus {
        self.gateway.status().await
    }

    // ========================================================================
    // HTTP Transport Support Methods
    // ========================================================================

    /// List all exposed tools as JSON.
    pub fn list_tools(&self) -> Vec<Value> {
        self.router
            .list_tools()
            .into_iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema
                })
            })
            .collect()
    }

    /// Call a tool and return the downstream result verbatim.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value, ToolError> {
        self.router.call(name, arguments).await
    }
}

/// Map a routed failure to a protocol error carrying the failure object.
pub fn to_mcp_error(err: &ToolError) -> McpError {
    let data = serde_json::to_value(err.to_failure()).ok();
    match err.fault() {
        Fault::Client => McpError::invalid_params(err.to_string(), data),
        Fault::Service => McpError::internal_error(err.to_string(), data),
    }
}

/// Convert a downstream `tools/call` result into the protocol model.
fn to_call_result(result: Value) -> CallToolResult {
    match serde_json::from_value::<CallToolResult>(result.clone()) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Downstream result is not a CallToolResult ({}), wrapping it", e);
            CallToolResult::success(vec![Content::text(result.to_string())])
        }
    }
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.to_string()),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info: Implementation {
                name: self.name().to_string(),
                version: self.version().to_string(),
                ..Implementation::from_build_env()
            },
            ..Default::default()
        }
    }

    #[instrument(skip(self, _context))]
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        info!("Listing tools");
        Ok(ListToolsResult {
            tools: self.router.list_tools(),
            next_cursor: None,
            meta: None,
        })
    }

    #[instrument(skip(self, request, _context), fields(tool = %request.name))]
    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        info!("Calling tool: {}", request.name);
        let arguments = request.arguments.map(Value::Object);
        match self.router.call(&request.name, arguments).await {
            Ok(result) => Ok(to_call_result(result)),
            Err(e) => {
                warn!("Tool call failed: {}", e);
                Err(to_mcp_error(&e))
            }
        }
    }

    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        let mut router = self.router.clone();
        let peer = context.peer;
        // Forward every newly published generation until the peer goes away.
        tokio::spawn(async move {
            while router.changed().await {
                if let Err(e) = peer.notify_tool_list_changed().await {
                    debug!("Peer gone, no more list_changed notifications: {}", e);
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::domains::directory::MemoryDirectory;
    use std::sync::Arc;

    fn server() -> GatewayServer {
        let directory = Arc::new(MemoryDirectory::new());
        GatewayServer::new(Gateway::new(Config::default(), directory.clone(), directory))
    }

    #[test]
    fn test_info_advertises_tool_list_changes() {
        let info = server().get_info();
        let tools = info.capabilities.tools.expect("tools capability");
        assert_eq!(tools.list_changed, Some(true));
        assert_eq!(info.server_info.name, "mcp-gateway");
    }

    #[test]
    fn test_error_mapping_by_fault() {
        let not_found = to_mcp_error(&ToolError::not_found("a/x", vec!["b/y".into()]));
        assert_eq!(not_found.code, ErrorCode::INVALID_PARAMS);
        let data = not_found.data.expect("failure data");
        assert_eq!(data["fault"], "client");
        assert_eq!(data["knownTools"][0], "b/y");

        let failed = to_mcp_error(&ToolError::DownstreamInvocation {
            tool: "a/x".into(),
            code: Some(-32000),
            message: "boom".into(),
        });
        assert_eq!(failed.code, ErrorCode::INTERNAL_ERROR);
    }

    #[test]
    fn test_call_result_passthrough() {
        let result = to_call_result(serde_json::json!({
            "content": [{"type": "text", "text": "hi"}],
            "isError": false
        }));
        assert_eq!(result.is_error, Some(false));
        assert_eq!(result.content.len(), 1);

        let wrapped = to_call_result(serde_json::json!(42));
        assert_eq!(wrapped.content.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_through_http_helpers() {
        let server = server();
        assert!(server.list_tools().is_empty());
        let err = server.call_tool("a/echo", None).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }
}
