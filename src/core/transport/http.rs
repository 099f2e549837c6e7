//! HTTP transport implementation.
//!
//! Two bindings over the same gateway:
//!
//! - `POST /mcp`: stateless JSON-RPC, one request per HTTP request
//! - `GET /sse` + `POST /messages?sessionId=...`: a long-lived
//!   Server-Sent-Events session. The first event (`endpoint`) names the URL
//!   to post requests to; replies and `notifications/tools/list_changed`
//!   arrive as `message` events on the stream.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream::{self, Stream, StreamExt};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{TransportError, TransportResult, config::HttpConfig};
use crate::core::GatewayServer;
use crate::core::server::INSTRUCTIONS;
use crate::domains::connections::PROTOCOL_VERSION;
use crate::domains::registry::RegistryState;
use crate::domains::tools::{CallRouter, Fault, ToolError};

/// Buffered outbound messages per SSE session.
const SESSION_BUFFER: usize = 64;

/// HTTP transport handler.
pub struct HttpTransport {
    config: HttpConfig,
}

/// JSON-RPC request structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    /// Create a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// Method not found error.
    pub fn method_not_found(id: Option<Value>) -> Self {
        Self::error(id, -32601, "Method not found", None)
    }

    /// Invalid request error.
    pub fn invalid_request(id: Option<Value>) -> Self {
        Self::error(id, -32600, "Invalid Request", None)
    }

    /// Invalid params error.
    pub fn invalid_params(id: Option<Value>, msg: impl Into<String>) -> Self {
        Self::error(id, -32602, msg, None)
    }

    /// A failed tool call, with the structured failure as `data`.
    pub fn tool_failure(id: Option<Value>, err: &ToolError) -> Self {
        let code = match err.fault() {
            Fault::Client => -32602,
            Fault::Service => -32603,
        };
        Self::error(id, code, err.to_string(), serde_json::to_value(err.to_failure()).ok())
    }
}

type Sessions = Arc<RwLock<HashMap<String, mpsc::Sender<Value>>>>;

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    server: GatewayServer,
    sessions: Sessions,
    rpc_path: String,
}

impl HttpTransport {
    /// Create a new HTTP transport with the given config.
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }

    /// Get the bind address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Build the axum application.
    pub fn app(&self, server: GatewayServer) -> Router {
        let state = AppState {
            server,
            sessions: Arc::default(),
            rpc_path: self.config.rpc_path.clone(),
        };

        let mut app = Router::new()
            .route(&self.config.rpc_path, post(handle_rpc))
            .route("/sse", get(handle_sse))
            .route("/messages", post(handle_message))
            .route("/health", get(health_check))
            .route("/", get(root_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            app = app.layer(cors);
        }

        app
    }

    /// Run the HTTP transport.
    pub async fn run(self, server: GatewayServer) -> TransportResult<()> {
        let addr = self.address();
        let app = self.app(server);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TransportError::bind(&addr, e))?;

        let cors_status = if self.config.enable_cors {
            "enabled"
        } else {
            "disabled"
        };
        info!(
            "Ready - listening on {} (JSON-RPC over HTTP, CORS {})",
            addr, cors_status
        );
        info!("  → JSON-RPC: POST {}", self.config.rpc_path);
        info!("  → Events:   GET /sse, POST /messages?sessionId=...");
        info!("  → Health:   GET /health");

        axum::serve(listener, app)
            .await
            .map_err(|e| TransportError::http(e.to_string()))?;

        Ok(())
    }
}

/// Root handler - provides API info.
async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "name": state.server.name(),
        "version": state.server.version(),
        "transport": "HTTP",
        "endpoints": {
            "rpc": state.rpc_path,
            "sse": "/sse",
            "messages": "/messages?sessionId=<id>",
            "health": "/health"
        },
        "protocol": "JSON-RPC 2.0"
    }))
}

/// Health check endpoint with registry introspection.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.server.status().await;
    let status = match registry.state {
        RegistryState::Live | RegistryState::Reloading => "healthy",
        RegistryState::Empty | RegistryState::Populating => "starting",
        RegistryState::Draining | RegistryState::Stopped => "stopping",
    };
    Json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "registry": registry
    }))
}

/// Handle a stateless JSON-RPC request.
#[instrument(skip_all, fields(method))]
async fn handle_rpc(State(state): State<AppState>, Json(request): Json<JsonRpcRequest>) -> Response {
    tracing::Span::current().record("method", &request.method);
    info!("Received JSON-RPC request: {}", request.method);

    match process_request(&state.server, request).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Query string of `POST /messages`.
#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Open an SSE session.
async fn handle_sse(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<Value>(SESSION_BUFFER);
    state.sessions.write().await.insert(session_id.clone(), tx.clone());
    info!("SSE session {} opened", session_id);

    forward_list_changes(state.server.router(), tx);

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?sessionId={session_id}"));
    let guard = SessionGuard {
        id: session_id,
        sessions: state.sessions.clone(),
    };

    let messages = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let message = rx.recv().await?;
        let event = Event::default().event("message").data(message.to_string());
        Some((Ok(event), (rx, guard)))
    });

    Sse::new(stream::once(async move { Ok(endpoint) }).chain(messages)).keep_alive(KeepAlive::default())
}

/// Accept a JSON-RPC message for an SSE session. The reply goes out on the
/// session's event stream.
async fn handle_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    Json(request): Json<JsonRpcRequest>,
) -> StatusCode {
    let sender = state.sessions.read().await.get(&query.session_id).cloned();
    let Some(sender) = sender else {
        warn!("Message for unknown SSE session {}", query.session_id);
        return StatusCode::NOT_FOUND;
    };

    debug!("SSE session {} sent {}", query.session_id, request.method);
    tokio::spawn(async move {
        let Some(response) = process_request(&state.server, request).await else {
            return;
        };
        match serde_json::to_value(response) {
            Ok(message) => {
                if sender.send(message).await.is_err() {
                    debug!("SSE session closed before its reply was sent");
                }
            }
            Err(e) => warn!("Failed to serialize reply: {}", e),
        }
    });

    StatusCode::ACCEPTED
}

/// Push `notifications/tools/list_changed` into a session whenever a new
/// generation is published, until the session goes away.
fn forward_list_changes(mut router: CallRouter, tx: mpsc::Sender<Value>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = router.changed() => {
                    if !changed {
                        break;
                    }
                    let note = json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"});
                    if tx.send(note).await.is_err() {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }
        }
    });
}

/// Removes a session from the table when its event stream is dropped.
struct SessionGuard {
    id: String,
    sessions: Sessions,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let id = std::mem::take(&mut self.id);
        let sessions = self.sessions.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                sessions.write().await.remove(&id);
                info!("SSE session {} closed", id);
            });
        }
    }
}

/// Process a JSON-RPC message. Notifications produce no response.
async fn process_request(server: &GatewayServer, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    if request.jsonrpc != "2.0" {
        return Some(JsonRpcResponse::invalid_request(request.id));
    }

    if request.id.is_none() || request.method.starts_with("notifications/") {
        debug!("Received notification: {}", request.method);
        return None;
    }

    let response = match request.method.as_str() {
        "initialize" => handle_initialize(server, request),
        "ping" => JsonRpcResponse::success(request.id, json!({})),
        "tools/list" => {
            JsonRpcResponse::success(request.id, json!({ "tools": server.list_tools() }))
        }
        "tools/call" => handle_tools_call(server, request).await,
        _ => {
            warn!("Unknown method: {}", request.method);
            JsonRpcResponse::method_not_found(request.id)
        }
    };
    Some(response)
}

fn handle_initialize(server: &GatewayServer, request: JsonRpcRequest) -> JsonRpcResponse {
    info!("Processing initialize request");
    JsonRpcResponse::success(
        request.id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": true } },
            "serverInfo": {
                "name": server.name(),
                "version": server.version()
            },
            "instructions": INSTRUCTIONS
        }),
    )
}

async fn handle_tools_call(server: &GatewayServer, request: JsonRpcRequest) -> JsonRpcResponse {
    let Some(params) = request.params else {
        return JsonRpcResponse::invalid_params(request.id, "Missing params");
    };
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::invalid_params(request.id, "Missing tool name");
    };
    info!("Processing tools/call request: {}", name);

    match server.call_tool(name, params.get("arguments").cloned()).await {
        Ok(result) => JsonRpcResponse::success(request.id, result),
        Err(e) => {
            warn!("Tool call failed: {}", e);
            JsonRpcResponse::tool_failure(request.id, &e)
        }
    }
}
