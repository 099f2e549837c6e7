//! Connection pool keyed by downstream server name.
//!
//! At most one connection per server exists at a time. Concurrent
//! [`ConnectionManager::acquire`] calls for the same server await the same
//! in-flight attempt. A cached connection that is no longer alive is replaced
//! on the next acquire, so callers never need to tell "never connected"
//! apart from "connected once, now dead".

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::client::DownstreamClient;
use super::error::{ConnectionError, ConnectionResult};
use crate::domains::channel::{ChannelOptions, MessageChannel, ProcessChannel};
use crate::domains::directory::{ConfigStore, LaunchParams, ProcessDirectory, ServerFilter};

// ============================================================================
// Settings
// ============================================================================

/// Timeouts and identity used when opening downstream connections.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Bound on channel setup plus the `initialize` handshake.
    pub connect_timeout: Duration,
    /// Bound on every directory and configuration-store call.
    pub directory_timeout: Duration,
    /// Bound on every individual JSON-RPC request.
    pub request_timeout: Duration,
    /// Framing options for new channels.
    pub channel: ChannelOptions,
    /// Client name sent in `initialize`.
    pub client_name: String,
    /// Client version sent in `initialize`.
    pub client_version: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            directory_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            channel: ChannelOptions::default(),
            client_name: "mcp-gateway".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A live, initialized connection to one downstream server.
pub struct Connection {
    server: String,
    client: DownstreamClient,
    channel: Arc<dyn MessageChannel>,
    created_at: DateTime<Utc>,
}

impl Connection {
    /// Server this connection belongs to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Protocol client.
    pub fn client(&self) -> &DownstreamClient {
        &self.client
    }

    /// When the connection was established.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether both the channel and the client are still usable.
    pub fn is_alive(&self) -> bool {
        self.channel.is_alive() && self.client.is_alive()
    }

    /// Inbound frames dropped on this connection's channel.
    pub fn dropped_frames(&self) -> u64 {
        self.channel.dropped_frames()
    }

    /// Close the client and the channel underneath it.
    pub async fn close(&self) {
        self.client.close().await;
        self.channel.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("channel", &self.channel.label())
            .field("created_at", &self.created_at)
            .finish()
    }
}

// ============================================================================
// Connection Manager
// ============================================================================

type SharedAcquire = Shared<BoxFuture<'static, ConnectionResult<Arc<Connection>>>>;

enum Slot {
    Ready(Arc<Connection>),
    Pending { attempt: u64, future: SharedAcquire },
}

struct ManagerInner {
    directory: Arc<dyn ProcessDirectory>,
    config: Arc<dyn ConfigStore>,
    settings: ConnectionSettings,
    slots: Mutex<HashMap<String, Slot>>,
    next_attempt: AtomicU64,
    opened: AtomicUsize,
}

/// Pool of downstream connections. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create an empty pool.
    pub fn new(
        directory: Arc<dyn ProcessDirectory>,
        config: Arc<dyn ConfigStore>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                directory,
                config,
                settings,
                slots: Mutex::new(HashMap::new()),
                next_attempt: AtomicU64::new(1),
                opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Connection settings in use.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    /// Return the cached live connection for `server`, or establish one.
    #[instrument(skip(self))]
    pub async fn acquire(&self, server: &str) -> ConnectionResult<Arc<Connection>> {
        let (attempt, future) = {
            let mut slots = self.inner.slots.lock().await;

            if let Some(Slot::Ready(connection)) = slots.get(server) {
                if connection.is_alive() {
                    return Ok(connection.clone());
                }
            }

            let in_flight = match slots.get(server) {
                Some(Slot::Pending { attempt, future }) => Some((*attempt, future.clone())),
                _ => None,
            };

            match in_flight {
                Some(joined) => joined,
                None => {
                    if let Some(Slot::Ready(stale)) = slots.remove(server) {
                        info!("Connection to {} is stale, reconnecting", server);
                        tokio::spawn(async move { stale.close().await });
                    }
                    let attempt = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
                    let future = open_connection(self.inner.clone(), server.to_string())
                        .boxed()
                        .shared();
                    slots.insert(
                        server.to_string(),
                        Slot::Pending {
                            attempt,
                            future: future.clone(),
                        },
                    );
                    (attempt, future)
                }
            }
        };

        let outcome = future.await;

        let mut slots = self.inner.slots.lock().await;
        let still_pending = matches!(
            slots.get(server),
            Some(Slot::Pending { attempt: current, .. }) if *current == attempt
        );

        match outcome {
            Ok(connection) => {
                if still_pending {
                    slots.insert(server.to_string(), Slot::Ready(connection.clone()));
                    return Ok(connection);
                }
                // Another waiter on the same attempt may have installed it.
                if matches!(slots.get(server), Some(Slot::Ready(c)) if Arc::ptr_eq(c, &connection)) {
                    return Ok(connection);
                }
                drop(slots);
                debug!("{} was released while connecting, discarding", server);
                connection.close().await;
                Err(ConnectionError::Released(server.to_string()))
            }
            Err(err) => {
                if still_pending {
                    slots.remove(server);
                }
                Err(err)
            }
        }
    }

    /// Close and forget the connection for `server`, if any.
    #[instrument(skip(self))]
    pub async fn release(&self, server: &str) {
        let slot = self.inner.slots.lock().await.remove(server);
        if let Some(Slot::Ready(connection)) = slot {
            info!("Releasing connection to {}", server);
            connection.close().await;
        }
    }

    /// Drop `connection` from the pool if it is still the cached one.
    ///
    /// Unlike [`release`](Self::release) this never touches a newer
    /// connection another caller has already put in its place.
    pub async fn invalidate(&self, connection: &Arc<Connection>) {
        let mut slots = self.inner.slots.lock().await;
        let cached = matches!(
            slots.get(connection.server()),
            Some(Slot::Ready(current)) if Arc::ptr_eq(current, connection)
        );
        if cached {
            slots.remove(connection.server());
        }
        drop(slots);
        connection.close().await;
    }

    /// Close and forget every pooled connection.
    pub async fn release_all(&self) {
        let slots: Vec<_> = self.inner.slots.lock().await.drain().collect();
        let connections: Vec<_> = slots
            .into_iter()
            .filter_map(|(_, slot)| match slot {
                Slot::Ready(connection) => Some(connection),
                Slot::Pending { .. } => None,
            })
            .collect();

        if !connections.is_empty() {
            info!("Releasing {} pooled connections", connections.len());
        }
        join_all(connections.iter().map(|c| c.close())).await;
    }

    /// Names of servers with a cached (possibly stale) connection.
    pub async fn connected_servers(&self) -> Vec<String> {
        let slots = self.inner.slots.lock().await;
        let mut names: Vec<_> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Unparseable inbound frames dropped across pooled connections.
    pub async fn dropped_frames(&self) -> u64 {
        let slots = self.inner.slots.lock().await;
        slots
            .values()
            .map(|slot| match slot {
                Slot::Ready(connection) => connection.dropped_frames(),
                Slot::Pending { .. } => 0,
            })
            .sum()
    }

    /// Total number of connections opened by this pool.
    pub fn opened_connections(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Call a tool through a freshly acquired connection.
    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> ConnectionResult<Value> {
        let connection = self.acquire(server).await?;
        connection.client().call_tool(tool, arguments).await
    }
}

async fn open_connection(inner: Arc<ManagerInner>, server: String) -> ConnectionResult<Arc<Connection>> {
    let settings = &inner.settings;

    let servers = tokio::time::timeout(
        settings.directory_timeout,
        inner.directory.list_servers(ServerFilter::Named(server.clone())),
    )
    .await
    .map_err(|_| ConnectionError::timeout(&server, "directory lookup"))?
    .map_err(|e| ConnectionError::directory(&server, &e))?;

    if !servers.iter().any(|s| s.name == server && s.is_online()) {
        return Err(ConnectionError::ServerNotRunning(server));
    }

    let params = tokio::time::timeout(settings.directory_timeout, inner.config.launch_params(&server))
        .await
        .map_err(|_| ConnectionError::timeout(&server, "launch parameter lookup"))?
        .map_err(|e| ConnectionError::directory(&server, &e))?;

    let channel = open_channel(&server, &params, settings)?;

    let handshake = async {
        let client =
            DownstreamClient::start(&server, channel.clone(), settings.request_timeout).await?;
        client
            .initialize(&settings.client_name, &settings.client_version)
            .await?;
        Ok::<_, ConnectionError>(client)
    };

    let client = match tokio::time::timeout(settings.connect_timeout, handshake).await {
        Ok(Ok(client)) => client,
        Ok(Err(err)) => {
            warn!("Handshake with {} failed: {}", server, err);
            channel.close().await;
            return Err(err);
        }
        Err(_) => {
            warn!("Handshake with {} timed out", server);
            channel.close().await;
            return Err(ConnectionError::timeout(&server, "connect"));
        }
    };

    inner.opened.fetch_add(1, Ordering::SeqCst);
    info!("Connected to downstream server {}", server);

    Ok(Arc::new(Connection {
        server,
        client,
        channel,
        created_at: Utc::now(),
    }))
}

fn open_channel(
    server: &str,
    params: &LaunchParams,
    settings: &ConnectionSettings,
) -> ConnectionResult<Arc<dyn MessageChannel>> {
    match params {
        LaunchParams::Stdio(spec) => {
            let channel = ProcessChannel::spawn(server, spec, settings.channel)
                .map_err(|e| ConnectionError::from_channel(server, &e))?;
            Ok(Arc::new(channel))
        }
        #[cfg(unix)]
        LaunchParams::Socket { path } => Ok(Arc::new(crate::domains::channel::SocketChannel::new(
            path.clone(),
            settings.connect_timeout,
            settings.channel,
        ))),
        #[cfg(not(unix))]
        LaunchParams::Socket { path } => Err(ConnectionError::Connect {
            server: server.to_string(),
            message: format!("local sockets are not supported here: {}", path.display()),
        }),
    }
}
