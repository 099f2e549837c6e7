//! The gateway context object.
//!
//! A [`Gateway`] owns every piece of process-wide mutable state: the
//! connection pool and the live registry. Nothing is global, so several
//! gateways can coexist in one process.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use super::config::Config;
use crate::domains::channel::ChannelOptions;
use crate::domains::connections::{ConnectionManager, ConnectionSettings};
use crate::domains::directory::{ConfigStore, ManifestDirectory, ProcessDirectory};
use crate::domains::registry::{Aggregator, RegistryStatus};
use crate::domains::tools::CallRouter;

/// Aggregation engine plus its configuration. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<Config>,
    aggregator: Aggregator,
}

impl Gateway {
    /// Create a gateway over the given directory and configuration store.
    pub fn new(
        config: Config,
        directory: Arc<dyn ProcessDirectory>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        let connections =
            ConnectionManager::new(directory.clone(), store, connection_settings(&config));
        let aggregator = Aggregator::new(directory, connections, config.gateway.poll_interval);
        Self {
            config: Arc::new(config),
            aggregator,
        }
    }

    /// Create a gateway reading downstream servers from the configured
    /// manifest file.
    pub fn from_manifest(config: Config) -> Self {
        let manifest = Arc::new(ManifestDirectory::new(&config.gateway.manifest_path));
        Self::new(config, manifest.clone(), manifest)
    }

    /// Get the gateway configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.config.server.name
    }

    /// Get the server version.
    pub fn version(&self) -> &str {
        &self.config.server.version
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// A router over the live registry.
    pub fn router(&self) -> CallRouter {
        self.aggregator.router()
    }

    /// Build the first generation, then keep polling in the background.
    pub async fn start(&self) -> JoinHandle<()> {
        let registry = self.aggregator.populate().await;
        info!(
            "Gateway live with {} tools from {} servers",
            registry.len(),
            registry.source_servers().len()
        );
        self.aggregator.spawn()
    }

    pub async fn status(&self) -> RegistryStatus {
        self.aggregator.status().await
    }

    /// Stop polling and release every downstream connection.
    pub async fn shutdown(&self) {
        self.aggregator.shutdown().await;
    }
}

/// Downstream connection settings derived from the configuration.
pub fn connection_settings(config: &Config) -> ConnectionSettings {
    let gateway = &config.gateway;
    ConnectionSettings {
        connect_timeout: gateway.connect_timeout,
        directory_timeout: gateway.directory_timeout,
        request_timeout: gateway.request_timeout,
        channel: ChannelOptions::default()
            .with_idle_timeout(Some(gateway.idle_timeout))
            .with_close_grace(gateway.close_grace),
        client_name: config.server.name.clone(),
        client_version: config.server.version.clone(),
    }
}
