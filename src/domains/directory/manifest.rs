//! File-backed directory.
//!
//! The manifest is a JSON document listing every installed downstream
//! server and how to reach it:
//!
//! ```json
//! {
//!   "servers": {
//!     "acme/search": { "command": "search-server", "args": ["--stdio"] },
//!     "acme/files":  { "transport": "socket", "socket": "/run/acme/files.sock" },
//!     "acme/old":    { "command": "old-server", "enabled": false }
//!   }
//! }
//! ```
//!
//! The file is re-read on every query so that edits are picked up by the
//! poll loop. Liveness snapshots are cached for a short TTL.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    ConfigStore, DirectoryError, DirectoryResult, DownstreamServer, LaunchParams, Liveness,
    ProcessDirectory, ServerFilter,
};
use crate::domains::channel::ProcessSpec;

/// Default lifetime of a cached liveness snapshot.
const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    servers: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryTransport {
    #[default]
    Stdio,
    Socket,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestEntry {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    transport: EntryTransport,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    socket: Option<PathBuf>,
    #[serde(default)]
    pid: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

impl ManifestEntry {
    async fn liveness(&self) -> Liveness {
        if !self.enabled {
            return Liveness::Offline;
        }
        let reachable = match self.transport {
            EntryTransport::Stdio => self.command.is_some(),
            EntryTransport::Socket => match &self.socket {
                Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
                None => false,
            },
        };
        if reachable {
            Liveness::Online
        } else {
            Liveness::Offline
        }
    }

    fn launch_params(&self, name: &str) -> DirectoryResult<LaunchParams> {
        match self.transport {
            EntryTransport::Stdio => {
                let command = self
                    .command
                    .clone()
                    .ok_or_else(|| DirectoryError::invalid(name, "stdio entry has no command"))?;
                Ok(LaunchParams::Stdio(ProcessSpec {
                    command,
                    args: self.args.clone(),
                    working_directory: self.cwd.clone(),
                    environment: self.env.clone(),
                }))
            }
            EntryTransport::Socket => {
                let path = self
                    .socket
                    .clone()
                    .ok_or_else(|| DirectoryError::invalid(name, "socket entry has no socket path"))?;
                Ok(LaunchParams::Socket { path })
            }
        }
    }
}

/// A directory backed by a JSON manifest on disk.
pub struct ManifestDirectory {
    path: PathBuf,
    snapshot_ttl: Duration,
    snapshot: Mutex<Option<(Instant, Vec<DownstreamServer>)>>,
}

impl ManifestDirectory {
    /// Create a directory reading `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot_ttl: DEFAULT_SNAPSHOT_TTL,
            snapshot: Mutex::new(None),
        }
    }

    /// Override the liveness snapshot TTL.
    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    /// Manifest location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> DirectoryResult<Manifest> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Manifest {} not found, no servers", self.path.display());
                return Ok(Manifest::default());
            }
            Err(source) => {
                return Err(DirectoryError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_str(&raw).map_err(|source| DirectoryError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    async fn snapshot(&self) -> DirectoryResult<Vec<DownstreamServer>> {
        let mut cached = self.snapshot.lock().await;
        if let Some((taken, servers)) = cached.as_ref() {
            if taken.elapsed() < self.snapshot_ttl {
                return Ok(servers.clone());
            }
        }

        let manifest = self.load().await?;
        let mut servers = Vec::with_capacity(manifest.servers.len());
        for (name, entry) in &manifest.servers {
            servers.push(DownstreamServer::new(name, entry.liveness().await, entry.pid));
        }

        *cached = Some((Instant::now(), servers.clone()));
        Ok(servers)
    }
}

#[async_trait]
impl ProcessDirectory for ManifestDirectory {
    async fn list_servers(&self, filter: ServerFilter) -> DirectoryResult<Vec<DownstreamServer>> {
        let servers = self.snapshot().await?;
        Ok(servers
            .into_iter()
            .filter(|server| filter.matches(&server.name))
            .collect())
    }
}

#[async_trait]
impl ConfigStore for ManifestDirectory {
    async fn launch_params(&self, server: &str) -> DirectoryResult<LaunchParams> {
        let manifest = self.load().await?;
        manifest
            .servers
            .get(server)
            .ok_or_else(|| DirectoryError::unknown(server))?
            .launch_params(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_manifest(dir: &TempDir, body: serde_json::Value) -> PathBuf {
        let path = dir.path().join("servers.json");
        fs::write(&path, body.to_string()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_manifest_means_no_servers() {
        let dir = TempDir::new().unwrap();
        let directory = ManifestDirectory::new(dir.path().join("absent.json"));
        let servers = directory.list_servers(ServerFilter::All).await.unwrap();
        assert!(servers.is_empty());
    }

    #[tokio::test]
    async fn test_liveness_rules() {
        let dir = TempDir::new().unwrap();
        let live_socket = dir.path().join("live.sock");
        fs::write(&live_socket, "").unwrap();

        let path = write_manifest(
            &dir,
            serde_json::json!({
                "servers": {
                    "a/stdio": { "command": "server-a", "pid": 42 },
                    "b/disabled": { "command": "server-b", "enabled": false },
                    "c/socket": { "transport": "socket", "socket": live_socket },
                    "d/socket": { "transport": "socket", "socket": dir.path().join("gone.sock") }
                }
            }),
        );
        let directory = ManifestDirectory::new(path);

        let servers = directory.list_servers(ServerFilter::All).await.unwrap();
        let online: Vec<_> = servers
            .iter()
            .filter(|s| s.is_online())
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(online, vec!["a/stdio", "c/socket"]);
        assert_eq!(servers[0].pid, Some(42));

        let named = directory
            .list_servers(ServerFilter::Named("b/disabled".to_string()))
            .await
            .unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].liveness, Liveness::Offline);
    }

    #[tokio::test]
    async fn test_launch_params() {
        let dir = TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            serde_json::json!({
                "servers": {
                    "a/stdio": {
                        "command": "server-a",
                        "args": ["--stdio"],
                        "cwd": "/srv/a",
                        "env": { "TOKEN": "x" }
                    },
                    "b/broken": { "transport": "socket" }
                }
            }),
        );
        let directory = ManifestDirectory::new(path);

        match directory.launch_params("a/stdio").await.unwrap() {
            LaunchParams::Stdio(spec) => {
                assert_eq!(spec.command, "server-a");
                assert_eq!(spec.args, vec!["--stdio"]);
                assert_eq!(spec.working_directory, Some(PathBuf::from("/srv/a")));
                assert_eq!(spec.environment.get("TOKEN").map(String::as_str), Some("x"));
            }
            other => panic!("expected stdio launch, got {other:?}"),
        }

        assert!(matches!(
            directory.launch_params("b/broken").await,
            Err(DirectoryError::InvalidEntry { .. })
        ));
        assert!(matches!(
            directory.launch_params("nope").await,
            Err(DirectoryError::UnknownServer(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_refreshes_after_ttl() {
        let dir = TempDir::new().unwrap();
        let path = write_manifest(&dir, serde_json::json!({ "servers": {} }));
        let directory = ManifestDirectory::new(&path).with_snapshot_ttl(Duration::ZERO);
        assert!(directory.list_servers(ServerFilter::All).await.unwrap().is_empty());

        write_manifest(
            &dir,
            serde_json::json!({ "servers": { "a/new": { "command": "x" } } }),
        );
        let servers = directory.list_servers(ServerFilter::All).await.unwrap();
        assert_eq!(servers.len(), 1);
    }

    #[tokio::test]
    async fn test_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.json");
        fs::write(&path, "{ not json").unwrap();

        let directory = ManifestDirectory::new(path);
        assert!(matches!(
            directory.list_servers(ServerFilter::All).await,
            Err(DirectoryError::Parse { .. })
        ));
    }
}
