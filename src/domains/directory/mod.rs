//! Downstream server directory.
//!
//! The gateway does not start, stop or install downstream servers. It only
//! asks two read-only collaborators:
//!
//! - [`ProcessDirectory`]: which servers exist and whether they are online
//! - [`ConfigStore`]: how to reach a given server
//!
//! Two implementations ship with the crate: [`ManifestDirectory`] reads a
//! JSON manifest from disk on every poll, [`MemoryDirectory`] is mutated in
//! process by embedders and tests.

mod error;
mod manifest;
mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domains::channel::ProcessSpec;

pub use error::{DirectoryError, DirectoryResult};
pub use manifest::ManifestDirectory;
pub use memory::MemoryDirectory;

/// Whether a downstream server is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Online,
    Offline,
}

/// A liveness snapshot for one downstream server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamServer {
    /// Unique, opaque name such as `author/repo`.
    pub name: String,
    /// Online or offline as of the snapshot.
    pub liveness: Liveness,
    /// Process id, when the directory knows one.
    pub pid: Option<u32>,
}

impl DownstreamServer {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, liveness: Liveness, pid: Option<u32>) -> Self {
        Self {
            name: name.into(),
            liveness,
            pid,
        }
    }

    /// Whether the server is online.
    pub fn is_online(&self) -> bool {
        self.liveness == Liveness::Online
    }
}

/// Which servers a directory query should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFilter {
    All,
    Named(String),
}

impl ServerFilter {
    /// Whether `name` passes the filter.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Named(wanted) => wanted == name,
        }
    }
}

/// How to reach a downstream server.
#[derive(Debug, Clone)]
pub enum LaunchParams {
    /// Spawn a child process and speak JSON-RPC over its stdio.
    Stdio(ProcessSpec),
    /// Attach to an already-listening local socket.
    Socket { path: PathBuf },
}

/// Source of downstream liveness snapshots.
#[async_trait]
pub trait ProcessDirectory: Send + Sync {
    /// List servers matching `filter`.
    async fn list_servers(&self, filter: ServerFilter) -> DirectoryResult<Vec<DownstreamServer>>;
}

/// Source of per-server launch parameters.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Launch parameters for `server`.
    async fn launch_params(&self, server: &str) -> DirectoryResult<LaunchParams>;
}
