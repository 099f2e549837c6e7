//! JSON-RPC client for one downstream server.
//!
//! Requests carry monotonically increasing integer ids. A single dispatcher
//! task reads the channel's inbound stream and hands each reply to the
//! request waiting for it. When the stream ends, every waiting request fails
//! with [`ConnectionError::ConnectionBroken`] and later requests fail with
//! [`ConnectionError::Undelivered`] without being written.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::error::{ConnectionError, ConnectionResult};
use super::protocol::{
    Inbound, JsonRpcNotification, JsonRpcRequest, PROTOCOL_VERSION, ToolInfo,
};
use crate::domains::channel::{ChannelError, MessageChannel, MessageStream};

type Reply = ConnectionResult<Value>;
type PendingReplies = Arc<Mutex<Pending>>;

/// Requests waiting for a reply. Once `closed`, nothing new is registered.
#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
    closed: bool,
}

/// Upper bound on `tools/list` pages followed for one server.
const MAX_TOOL_PAGES: usize = 64;

/// A JSON-RPC client bound to one message channel.
pub struct DownstreamClient {
    server: String,
    channel: Arc<dyn MessageChannel>,
    pending: PendingReplies,
    next_id: AtomicU64,
    request_timeout: Duration,
    dispatcher: JoinHandle<()>,
}

impl DownstreamClient {
    /// Subscribe to the channel and start dispatching replies.
    pub async fn start(
        server: impl Into<String>,
        channel: Arc<dyn MessageChannel>,
        request_timeout: Duration,
    ) -> ConnectionResult<Self> {
        let server = server.into();
        let stream = channel
            .subscribe()
            .await
            .map_err(|e| ConnectionError::from_channel(&server, &e))?;

        let pending: PendingReplies = Arc::new(Mutex::new(Pending::default()));
        let dispatcher = tokio::spawn(dispatch(
            server.clone(),
            stream,
            channel.clone(),
            pending.clone(),
        ));

        Ok(Self {
            server,
            channel,
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
            dispatcher,
        })
    }

    /// Name of the server this client talks to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Whether the channel is usable and replies are still being read.
    pub fn is_alive(&self) -> bool {
        self.channel.is_alive() && !self.dispatcher.is_finished()
    }

    /// Perform the MCP handshake.
    #[instrument(skip(self), fields(server = %self.server))]
    pub async fn initialize(&self, client_name: &str, client_version: &str) -> ConnectionResult<Value> {
        let result = self
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": client_name, "version": client_version }
                })),
            )
            .await?;

        self.notify("notifications/initialized", None).await?;

        let server_info = result.get("serverInfo").cloned().unwrap_or(Value::Null);
        info!("Initialized downstream {}: {}", self.server, server_info);
        Ok(server_info)
    }

    /// Fetch every advertised tool, following pagination cursors.
    #[instrument(skip(self), fields(server = %self.server))]
    pub async fn list_tools(&self) -> ConnectionResult<Vec<ToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page = self.request("tools/list", params).await?;

            let entries = page
                .get("tools")
                .and_then(Value::as_array)
                .ok_or_else(|| ConnectionError::protocol(&self.server, "tools/list reply has no tools array"))?;

            for entry in entries {
                match serde_json::from_value::<ToolInfo>(entry.clone()) {
                    Ok(tool) => tools.push(tool),
                    Err(e) => warn!("Skipping malformed tool entry from {}: {}", self.server, e),
                }
            }

            cursor = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        debug!("{} advertises {} tools", self.server, tools.len());
        Ok(tools)
    }

    /// Invoke a tool and return the raw `result` object.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ConnectionResult<Value> {
        self.request(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// Send a request and wait for its reply.
    ///
    /// Fails with [`ConnectionError::Undelivered`] only when nothing was
    /// written. Once the request is on the wire, losing the connection is
    /// reported as [`ConnectionError::ConnectionBroken`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> ConnectionResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| ConnectionError::protocol(&self.server, e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            // A dead client must not let the channel reconnect underneath it:
            // replies on a new connection would never reach this dispatcher.
            if pending.closed || !self.is_alive() {
                return Err(ConnectionError::undelivered(&self.server, "connection closed"));
            }
            pending.waiters.insert(id, tx);
        }

        if let Err(e) = self.channel.send(&message).await {
            self.pending.lock().await.waiters.remove(&id);
            return Err(match &e {
                ChannelError::NotWritable | ChannelError::ConnectionBroken(_) => {
                    ConnectionError::undelivered(&self.server, e.to_string())
                }
                _ => ConnectionError::from_channel(&self.server, &e),
            });
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ConnectionError::broken(&self.server, "connection closed")),
            Err(_) => {
                self.pending.lock().await.waiters.remove(&id);
                warn!("{} did not answer {} within {:?}", self.server, method, self.request_timeout);
                Err(ConnectionError::timeout(&self.server, "request"))
            }
        }
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> ConnectionResult<()> {
        let message = serde_json::to_value(JsonRpcNotification::new(method, params))
            .map_err(|e| ConnectionError::protocol(&self.server, e.to_string()))?;
        self.channel
            .send(&message)
            .await
            .map_err(|e| ConnectionError::from_channel(&self.server, &e))
    }

    /// Close the channel; the dispatcher fails any waiting requests.
    pub async fn close(&self) {
        self.channel.close().await;
        self.dispatcher.abort();
        fail_pending(&self.server, &self.pending).await;
    }
}

impl Drop for DownstreamClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(
    server: String,
    mut stream: MessageStream,
    channel: Arc<dyn MessageChannel>,
    pending: PendingReplies,
) {
    while let Some(message) = stream.next().await {
        match Inbound::classify(message) {
            Inbound::Response { id, outcome } => {
                let waiter = pending.lock().await.waiters.remove(&id);
                let reply = outcome.map_err(|err| ConnectionError::Remote {
                    server: server.clone(),
                    code: err.code,
                    message: err.message,
                });
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => debug!("{} answered unknown request id {}", server, id),
                }
            }
            Inbound::Request { id, method } => {
                answer_server_request(&server, channel.as_ref(), id, &method).await;
            }
            Inbound::Notification { method } => {
                debug!("Notification from {}: {}", server, method);
            }
            Inbound::Unknown => debug!("Ignoring non JSON-RPC message from {}", server),
        }
    }

    debug!("Inbound stream from {} ended", server);
    fail_pending(&server, &pending).await;
}

async fn answer_server_request(server: &str, channel: &dyn MessageChannel, id: Value, method: &str) {
    let reply = if method == "ping" {
        json!({ "jsonrpc": "2.0", "id": id, "result": {} })
    } else {
        debug!("{} sent unsupported request {}", server, method);
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": "Method not found" }
        })
    };
    if let Err(e) = channel.send(&reply).await {
        warn!("Failed to answer {} from {}: {}", method, server, e);
    }
}

async fn fail_pending(server: &str, pending: &PendingReplies) {
    let waiters: Vec<_> = {
        let mut pending = pending.lock().await;
        pending.closed = true;
        pending.waiters.drain().collect()
    };
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(ConnectionError::broken(server, "connection closed")));
    }
}
