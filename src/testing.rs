//! Test fixtures: an in-process fake downstream tool server reachable over a
//! Unix socket and speaking newline-delimited JSON-RPC.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

use crate::domains::connections::PROTOCOL_VERSION;

/// Build a tool advertisement.
pub(crate) fn tool(name: &str, schema: Value) -> Value {
    json!({ "name": name, "description": format!("{name} tool"), "inputSchema": schema })
}

/// Behaviour of a fake downstream tool server.
///
/// Known tools when called: `echo` returns its `text` argument, `sum` adds
/// `a` and `b`, `fail` answers with a JSON-RPC error. With `hang_up_on_call`
/// set, every `tools/call` is counted and the connection dropped unanswered.
/// With `noisy` set, every reply is preceded by a line that is not JSON.
#[derive(Clone)]
pub(crate) struct FakeServer {
    pub tools: Vec<Value>,
    pub page_size: usize,
    pub hang_up_on_call: bool,
    pub noisy: bool,
}

impl FakeServer {
    pub(crate) fn with_tools(tools: Vec<Value>) -> Self {
        Self {
            tools,
            page_size: usize::MAX,
            hang_up_on_call: false,
            noisy: false,
        }
    }

    fn handle(&self, request: &Value) -> Option<Value> {
        let id = request.get("id")?.clone();
        let method = request.get("method")?.as_str()?;
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let outcome = match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "fake", "version": "0.0.1" }
            })),
            "tools/list" => {
                let start: usize = params
                    .get("cursor")
                    .and_then(Value::as_str)
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0)
                    .min(self.tools.len());
                let end = start.saturating_add(self.page_size).min(self.tools.len());
                let mut page = json!({ "tools": &self.tools[start..end] });
                if end < self.tools.len() {
                    page["nextCursor"] = json!(end.to_string());
                }
                Ok(page)
            }
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                match name {
                    "echo" => Ok(json!({
                        "content": [{ "type": "text", "text": arguments["text"] }]
                    })),
                    "sum" => {
                        let a = arguments["a"].as_f64().unwrap_or(0.0);
                        let b = arguments["b"].as_f64().unwrap_or(0.0);
                        Ok(json!({ "content": [{ "type": "text", "text": (a + b).to_string() }] }))
                    }
                    "fail" => Err(json!({ "code": -32000, "message": "tool exploded" })),
                    _ => Err(json!({ "code": -32602, "message": format!("unknown tool {name}") })),
                }
            }
            _ => Err(json!({ "code": -32601, "message": "Method not found" })),
        };

        Some(match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        })
    }

    /// Start serving on `path`.
    pub(crate) fn serve(self, path: &Path) -> RunningServer {
        let listener = UnixListener::bind(path).unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let tool_calls = Arc::new(AtomicUsize::new(0));
        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();

        let counter = accepted.clone();
        let calls = tool_calls.clone();
        let tasks = connections.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let server = self.clone();
                let calls = calls.clone();
                let task = tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let Ok(request) = serde_json::from_str::<Value>(&line) else {
                            continue;
                        };
                        if request.get("method").and_then(Value::as_str) == Some("tools/call") {
                            calls.fetch_add(1, Ordering::SeqCst);
                            if server.hang_up_on_call {
                                break;
                            }
                        }
                        if let Some(reply) = server.handle(&request) {
                            let frame = if server.noisy {
                                format!("not json\n{reply}\n")
                            } else {
                                format!("{reply}\n")
                            };
                            if write_half.write_all(frame.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    }
                });
                tasks.lock().unwrap().push(task);
            }
        });

        RunningServer {
            path: path.to_path_buf(),
            accept,
            connections,
            accepted,
            tool_calls,
        }
    }
}

/// Handle to a serving [`FakeServer`]; stops it on drop.
pub(crate) struct RunningServer {
    path: PathBuf,
    accept: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accepted: Arc<AtomicUsize>,
    tool_calls: Arc<AtomicUsize>,
}

impl RunningServer {
    /// Connections accepted so far.
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// `tools/call` requests received so far, answered or not.
    pub(crate) fn tool_calls(&self) -> usize {
        self.tool_calls.load(Ordering::SeqCst)
    }

    /// Stop accepting, drop every open connection and remove the socket.
    pub(crate) fn stop(&self) {
        self.accept.abort();
        for task in self.connections.lock().unwrap().drain(..) {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.stop();
    }
}
