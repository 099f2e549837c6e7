//! In-process directory, mutated directly by its owner.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{
    ConfigStore, DirectoryError, DirectoryResult, DownstreamServer, LaunchParams, Liveness,
    ProcessDirectory, ServerFilter,
};
use crate::domains::channel::ProcessSpec;

#[derive(Debug, Clone)]
struct MemoryEntry {
    liveness: Liveness,
    pid: Option<u32>,
    params: LaunchParams,
}

/// A directory held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: RwLock<BTreeMap<String, MemoryEntry>>,
    launch_lookups: AtomicUsize,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a server.
    pub fn insert(&self, name: impl Into<String>, params: LaunchParams, liveness: Liveness) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            name.into(),
            MemoryEntry {
                liveness,
                pid: None,
                params,
            },
        );
    }

    /// Register an online server reachable over a local socket.
    pub fn insert_socket(&self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.insert(name, LaunchParams::Socket { path: path.into() }, Liveness::Online);
    }

    /// Register an online server launched as a child process.
    pub fn insert_process(&self, name: impl Into<String>, spec: ProcessSpec) {
        self.insert(name, LaunchParams::Stdio(spec), Liveness::Online);
    }

    /// Forget a server entirely.
    pub fn remove(&self, name: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(name);
    }

    /// Mark a server online.
    pub fn set_online(&self, name: &str) {
        self.set_liveness(name, Liveness::Online);
    }

    /// Mark a server offline.
    pub fn set_offline(&self, name: &str) {
        self.set_liveness(name, Liveness::Offline);
    }

    /// Record the process id reported for a server.
    pub fn set_pid(&self, name: &str, pid: Option<u32>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(name) {
            entry.pid = pid;
        }
    }

    fn set_liveness(&self, name: &str, liveness: Liveness) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(name) {
            entry.liveness = liveness;
        }
    }

    /// How many times launch parameters were requested.
    pub fn launch_lookups(&self) -> usize {
        self.launch_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessDirectory for MemoryDirectory {
    async fn list_servers(&self, filter: ServerFilter) -> DirectoryResult<Vec<DownstreamServer>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .filter(|(name, _)| filter.matches(name))
            .map(|(name, entry)| DownstreamServer::new(name, entry.liveness, entry.pid))
            .collect())
    }
}

#[async_trait]
impl ConfigStore for MemoryDirectory {
    async fn launch_params(&self, server: &str) -> DirectoryResult<LaunchParams> {
        self.launch_lookups.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(server)
            .map(|entry| entry.params.clone())
            .ok_or_else(|| DirectoryError::unknown(server))
    }
}
