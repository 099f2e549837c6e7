//! Hot-reload engine.
//!
//! The [`Aggregator`] owns the live [`AggregatedRegistry`] and keeps it in
//! step with the set of online downstream servers:
//!
//! ```text
//! Empty -> Populating -> Live -> Reloading -> Live -> ... -> Draining -> Stopped
//! ```
//!
//! Every reload builds a complete new generation before publishing it with a
//! single pointer swap, so readers see either the old set or the new one.
//! Reloads are serialized; a poll tick that finds one already running does
//! nothing.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::aggregate::AggregatedRegistry;
use crate::domains::connections::ConnectionManager;
use crate::domains::directory::{DirectoryError, ProcessDirectory, ServerFilter};
use crate::domains::tools::{CallRouter, discover_tools};

/// Online server names as observed by one directory query.
pub type Topology = BTreeSet<String>;

// ============================================================================
// State
// ============================================================================

/// Lifecycle of the aggregated registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryState {
    Empty,
    Populating,
    Live,
    Reloading,
    Draining,
    Stopped,
}

/// What one poll tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Topology unchanged; nothing to do.
    Unchanged,
    /// Topology changed and a new generation was published.
    Reloaded { generation: u64 },
    /// Another reload was in flight, or the registry is not live.
    Skipped,
    /// The directory could not be queried; the live registry is untouched.
    Failed(String),
}

/// Point-in-time view of the registry, for health checks.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub state: RegistryState,
    pub generation: u64,
    pub servers: Vec<String>,
    pub tool_count: usize,
    pub connections: Vec<String>,
    pub dropped_frames: u64,
}

// ============================================================================
// Aggregator
// ============================================================================

struct Inner {
    directory: Arc<dyn ProcessDirectory>,
    connections: ConnectionManager,
    poll_interval: Duration,
    directory_timeout: Duration,
    live: watch::Sender<Arc<AggregatedRegistry>>,
    state: watch::Sender<RegistryState>,
    /// Last-known topology. Holding the lock is holding the right to reload.
    topology: Mutex<Option<Topology>>,
    generations: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Owner of the live registry. Cheap to clone.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    /// Create an aggregator with an empty live registry.
    pub fn new(
        directory: Arc<dyn ProcessDirectory>,
        connections: ConnectionManager,
        poll_interval: Duration,
    ) -> Self {
        let directory_timeout = connections.settings().directory_timeout;
        let (live, _) = watch::channel(Arc::new(AggregatedRegistry::empty()));
        let (state, _) = watch::channel(RegistryState::Empty);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                directory,
                connections,
                poll_interval,
                directory_timeout,
                live,
                state,
                topology: Mutex::new(None),
                generations: AtomicU64::new(0),
                shutdown,
            }),
        }
    }

    /// Connection pool shared with every descriptor.
    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    /// A router reading from the live registry.
    pub fn router(&self) -> CallRouter {
        CallRouter::new(self.inner.live.subscribe())
    }

    /// The live registry.
    pub fn current(&self) -> Arc<AggregatedRegistry> {
        self.inner.live.borrow().clone()
    }

    pub fn state(&self) -> RegistryState {
        *self.inner.state.borrow()
    }

    /// Current state, generation and topology.
    pub async fn status(&self) -> RegistryStatus {
        let registry = self.current();
        RegistryStatus {
            state: self.state(),
            generation: registry.generation(),
            servers: registry.source_servers().iter().cloned().collect(),
            tool_count: registry.len(),
            connections: self.inner.connections.connected_servers().await,
            dropped_frames: self.inner.connections.dropped_frames().await,
        }
    }

    /// Initial build: discover every online server and publish the result.
    #[instrument(skip(self))]
    pub async fn populate(&self) -> Arc<AggregatedRegistry> {
        let mut topology = self.inner.topology.lock().await;
        if matches!(self.state(), RegistryState::Draining | RegistryState::Stopped) {
            return self.current();
        }

        self.set_state(RegistryState::Populating);
        match self.online_servers().await {
            Ok(online) => {
                self.rebuild(&online).await;
                *topology = Some(online);
            }
            Err(e) => {
                // Nothing is known yet, so the next poll rebuilds.
                warn!("Initial directory query failed, starting empty: {}", e);
                self.publish(AggregatedRegistry::new(self.next_generation(), Vec::new()));
                *topology = None;
            }
        }
        self.set_state(RegistryState::Live);
        self.current()
    }

    /// One poll tick: compare the online set with the last-known topology
    /// and reload if they differ.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> PollOutcome {
        let Ok(mut topology) = self.inner.topology.try_lock() else {
            debug!("Reload already in progress, skipping tick");
            return PollOutcome::Skipped;
        };
        if self.state() != RegistryState::Live {
            return PollOutcome::Skipped;
        }

        let online = match self.online_servers().await {
            Ok(online) => online,
            Err(e) => {
                warn!("Directory query failed, keeping current registry: {}", e);
                return PollOutcome::Failed(e.to_string());
            }
        };

        if topology.as_ref() == Some(&online) {
            return PollOutcome::Unchanged;
        }

        info!(
            "Topology changed: {:?} -> {:?}",
            topology.as_ref().map(|t| t.iter().collect::<Vec<_>>()).unwrap_or_default(),
            online.iter().collect::<Vec<_>>()
        );

        self.set_state(RegistryState::Reloading);
        self.inner.connections.release_all().await;
        let generation = self.rebuild(&online).await;
        *topology = Some(online);
        self.set_state(RegistryState::Live);

        PollOutcome::Reloaded { generation }
    }

    /// Populate if needed, then poll on a fixed interval until
    /// [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        let mut stop = self.inner.shutdown.subscribe();
        if *stop.borrow_and_update() {
            return;
        }

        if self.state() == RegistryState::Empty {
            self.populate().await;
        }

        let mut ticker = tokio::time::interval(self.inner.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!("Polling for topology changes every {:?}", self.inner.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        PollOutcome::Reloaded { generation } => info!("Published generation {}", generation),
                        PollOutcome::Failed(reason) => debug!("Poll failed: {}", reason),
                        PollOutcome::Unchanged | PollOutcome::Skipped => {}
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Poll loop stopped");
    }

    /// Run the poll loop on its own task.
    pub fn spawn(&self) -> JoinHandle<()> {
        let aggregator = self.clone();
        tokio::spawn(async move { aggregator.run().await })
    }

    /// Stop polling, release every connection and publish an empty registry.
    ///
    /// Waits for an in-flight reload to finish first.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);

        let mut topology = self.inner.topology.lock().await;
        if self.state() == RegistryState::Stopped {
            return;
        }

        self.set_state(RegistryState::Draining);
        info!("Draining downstream connections");
        self.inner.connections.release_all().await;
        self.publish(AggregatedRegistry::new(self.next_generation(), Vec::new()));
        *topology = None;
        self.set_state(RegistryState::Stopped);
        info!("Registry stopped");
    }

    async fn online_servers(&self) -> Result<Topology, DirectoryError> {
        let servers = tokio::time::timeout(
            self.inner.directory_timeout,
            self.inner.directory.list_servers(ServerFilter::All),
        )
        .await
        .map_err(|_| DirectoryError::Timeout(self.inner.directory_timeout))??;

        Ok(servers
            .into_iter()
            .filter(|s| s.is_online())
            .map(|s| s.name)
            .collect())
    }

    /// Discover every server in `online` and publish the merged generation.
    /// Servers that fail discovery are left out.
    async fn rebuild(&self, online: &Topology) -> u64 {
        let connections = &self.inner.connections;
        let results = join_all(online.iter().map(|server| async move {
            (server.clone(), discover_tools(connections, server).await)
        }))
        .await;

        let mut discovered = Vec::with_capacity(results.len());
        for (server, result) in results {
            match result {
                Ok(descriptors) => discovered.push((server, descriptors)),
                Err(e) => warn!("Skipping {} for this generation: {}", server, e),
            }
        }

        let generation = self.next_generation();
        let registry = AggregatedRegistry::new(generation, discovered);
        info!(
            "Generation {}: {} tools from {} of {} servers",
            generation,
            registry.len(),
            registry.source_servers().len(),
            online.len()
        );
        self.publish(registry);
        generation
    }

    fn publish(&self, registry: AggregatedRegistry) {
        self.inner.live.send_replace(Arc::new(registry));
    }

    fn next_generation(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_state(&self, state: RegistryState) {
        debug!("Registry state: {:?}", state);
        self.inner.state.send_replace(state);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domains::connections::ConnectionSettings;
    use crate::domains::directory::{DirectoryResult, DownstreamServer, MemoryDirectory};
    use crate::domains::tools::ToolError;
    use crate::testing::{FakeServer, RunningServer, tool};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    /// Memory directory whose listing can be made to fail.
    struct FlakyDirectory {
        inner: Arc<MemoryDirectory>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl ProcessDirectory for FlakyDirectory {
        async fn list_servers(&self, filter: ServerFilter) -> DirectoryResult<Vec<DownstreamServer>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DirectoryError::Timeout(Duration::from_millis(1)));
            }
            self.inner.list_servers(filter).await
        }
    }

    struct Fixture {
        dir: TempDir,
        directory: Arc<MemoryDirectory>,
        flaky: Arc<FlakyDirectory>,
        aggregator: Aggregator,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let directory = Arc::new(MemoryDirectory::new());
            let flaky = Arc::new(FlakyDirectory {
                inner: directory.clone(),
                failing: AtomicBool::new(false),
            });
            let settings = ConnectionSettings {
                connect_timeout: Duration::from_secs(2),
                request_timeout: Duration::from_secs(2),
                ..Default::default()
            };
            let connections = ConnectionManager::new(directory.clone(), directory.clone(), settings);
            let aggregator = Aggregator::new(flaky.clone(), connections, Duration::from_millis(50));
            Self {
                dir,
                directory,
                flaky,
                aggregator,
            }
        }

        fn socket(&self, name: &str) -> PathBuf {
            self.dir.path().join(format!("{name}.sock"))
        }

        fn serve(&self, name: &str, tools: Vec<serde_json::Value>) -> RunningServer {
            let path = self.socket(name);
            let running = FakeServer::with_tools(tools).serve(&path);
            self.directory.insert_socket(name, &path);
            running
        }
    }

    fn echo() -> serde_json::Value {
        tool("echo", json!({"type": "object", "properties": {"text": {"type": "string"}}}))
    }

    fn sum() -> serde_json::Value {
        tool("sum", json!({"type": "object", "properties": {"a": {"type": "number"}, "b": {"type": "number"}}}))
    }

    fn names(aggregator: &Aggregator) -> Vec<String> {
        aggregator.current().tool_names()
    }

    #[tokio::test]
    async fn test_initial_build_merges_servers() {
        let fx = Fixture::new();
        let _a = fx.serve("a", vec![echo()]);
        let _b = fx.serve("b", vec![sum()]);

        assert_eq!(fx.aggregator.state(), RegistryState::Empty);
        let registry = fx.aggregator.populate().await;

        assert_eq!(registry.tool_names(), vec!["a/echo", "b/sum"]);
        assert_eq!(registry.generation(), 1);
        assert_eq!(fx.aggregator.state(), RegistryState::Live);
    }

    #[tokio::test]
    async fn test_unchanged_topology_keeps_generation() {
        let fx = Fixture::new();
        let _a = fx.serve("a", vec![echo()]);
        fx.aggregator.populate().await;

        assert_eq!(fx.aggregator.poll_once().await, PollOutcome::Unchanged);
        assert_eq!(fx.aggregator.poll_once().await, PollOutcome::Unchanged);
        assert_eq!(fx.aggregator.current().generation(), 1);
    }

    #[tokio::test]
    async fn test_server_going_offline_triggers_one_reload() {
        let fx = Fixture::new();
        let _a = fx.serve("a", vec![echo()]);
        let _b = fx.serve("b", vec![sum()]);
        fx.aggregator.populate().await;
        let router = fx.aggregator.router();

        fx.directory.set_offline("b");
        assert_eq!(
            fx.aggregator.poll_once().await,
            PollOutcome::Reloaded { generation: 2 }
        );
        assert_eq!(fx.aggregator.poll_once().await, PollOutcome::Unchanged);

        assert_eq!(names(&fx.aggregator), vec!["a/echo"]);
        let sources: Vec<_> = fx.aggregator.current().source_servers().iter().cloned().collect();
        assert_eq!(sources, vec!["a"]);
        assert_eq!(fx.aggregator.connections().connected_servers().await, vec!["a"]);

        let err = router.call("b/sum", Some(json!({}))).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_new_server_is_picked_up() {
        let fx = Fixture::new();
        let _a = fx.serve("a", vec![echo()]);
        fx.aggregator.populate().await;

        let _b = fx.serve("b", vec![sum()]);
        assert!(matches!(fx.aggregator.poll_once().await, PollOutcome::Reloaded { .. }));
        assert_eq!(names(&fx.aggregator), vec!["a/echo", "b/sum"]);

        let result = fx
            .aggregator
            .router()
            .call("b/sum", Some(json!({"a": 1, "b": 2})))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "3");
    }

    #[tokio::test]
    async fn test_failed_server_is_skipped() {
        let fx = Fixture::new();
        let _a = fx.serve("a", vec![echo()]);
        fx.directory.insert_socket("ghost", fx.socket("ghost"));

        let registry = fx.aggregator.populate().await;
        assert_eq!(registry.tool_names(), vec!["a/echo"]);
        assert!(!registry.source_servers().contains("ghost"));
        assert_eq!(fx.aggregator.state(), RegistryState::Live);

        // The topology still includes the ghost, so nothing reloads.
        assert_eq!(fx.aggregator.poll_once().await, PollOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_total_failure_yields_empty_live_registry() {
        let fx = Fixture::new();
        fx.directory.insert_socket("ghost", fx.socket("ghost"));

        let registry = fx.aggregator.populate().await;
        assert!(registry.is_empty());
        assert_eq!(fx.aggregator.state(), RegistryState::Live);
    }

    #[tokio::test]
    async fn test_directory_failure_is_a_no_op_tick() {
        let fx = Fixture::new();
        let _a = fx.serve("a", vec![echo()]);
        fx.aggregator.populate().await;

        fx.flaky.failing.store(true, Ordering::SeqCst);
        assert!(matches!(fx.aggregator.poll_once().await, PollOutcome::Failed(_)));
        assert_eq!(names(&fx.aggregator), vec!["a/echo"]);
        assert_eq!(fx.aggregator.current().generation(), 1);

        fx.flaky.failing.store(false, Ordering::SeqCst);
        assert_eq!(fx.aggregator.poll_once().await, PollOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let fx = Fixture::new();
        let _a = fx.serve("a", vec![echo()]);
        fx.aggregator.populate().await;
        fx.directory.set_offline("a");

        let guard = fx.aggregator.inner.topology.lock().await;
        assert_eq!(fx.aggregator.poll_once().await, PollOutcome::Skipped);
        drop(guard);

        assert!(matches!(fx.aggregator.poll_once().await, PollOutcome::Reloaded { .. }));
        assert!(fx.aggregator.current().is_empty());
    }

    #[tokio::test]
    async fn test_restarted_server_is_reached_on_first_call() {
        let fx = Fixture::new();
        let a = fx.serve("a", vec![echo()]);
        fx.aggregator.populate().await;
        let router = fx.aggregator.router();

        a.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _restarted = FakeServer::with_tools(vec![echo()]).serve(&fx.socket("a"));

        let result = router.call("a/echo", Some(json!({"text": "hi"}))).await.unwrap();
        assert_eq!(result, json!({"content": [{"type": "text", "text": "hi"}]}));
    }

    #[tokio::test]
    async fn test_poll_loop_and_shutdown() {
        let fx = Fixture::new();
        let _a = fx.serve("a", vec![echo()]);
        let mut router = fx.aggregator.router();

        let handle = fx.aggregator.spawn();
        // Initial build, then the reload for `b`.
        assert!(tokio::time::timeout(Duration::from_secs(2), router.changed()).await.unwrap());
        let _b = fx.serve("b", vec![sum()]);
        tokio::time::timeout(Duration::from_secs(2), async {
            while router.snapshot().len() < 2 {
                router.changed().await;
            }
        })
        .await
        .unwrap();

        fx.aggregator.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        let status = fx.aggregator.status().await;
        assert_eq!(status.state, RegistryState::Stopped);
        assert_eq!(status.tool_count, 0);
        assert!(status.connections.is_empty());
        assert_eq!(fx.aggregator.poll_once().await, PollOutcome::Skipped);
    }

    #[test]
    fn test_status_serializes_lowercase_state() {
        let status = RegistryStatus {
            state: RegistryState::Reloading,
            generation: 4,
            servers: vec!["a".into()],
            tool_count: 1,
            connections: vec![],
            dropped_frames: 3,
        };
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(value["state"], "reloading");
        assert_eq!(value["dropped_frames"], 3);
    }
}
