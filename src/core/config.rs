//! Configuration management for the gateway.
//!
//! This module provides a centralized configuration structure populated from
//! environment variables (after loading an optional `.env` file) on top of
//! defaults.

use super::error::{Error, Result};
use super::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server identification and metadata.
    pub server: ServerConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Outward transport configuration.
    pub transport: TransportConfig,

    /// Downstream aggregation settings.
    pub gateway: GatewayConfig,
}

/// Server identification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The name of the server as reported to clients and downstream servers.
    pub name: String,

    /// The version of the server.
    pub version: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "trace").
    pub level: String,
}

/// Downstream discovery, polling and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// JSON manifest listing downstream servers.
    pub manifest_path: PathBuf,

    /// How often the directory is polled for topology changes.
    pub poll_interval: Duration,

    /// Bound on establishing a downstream connection and its handshake.
    pub connect_timeout: Duration,

    /// Bound on every directory and configuration-store query.
    pub directory_timeout: Duration,

    /// Bound on every downstream request.
    pub request_timeout: Duration,

    /// Socket connections silent for this long are torn down.
    pub idle_timeout: Duration,

    /// How long `close` waits for the peer before forcing.
    pub close_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("gateway.json"),
            poll_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            directory_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            close_grace: Duration::from_secs(2),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                name: "mcp-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            transport: TransportConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables are expected to be prefixed with `MCP_`.
    /// For example: `MCP_SERVER_NAME`, `MCP_POLL_INTERVAL_MS`. Fails when the
    /// requested transport is not compiled in or its settings do not parse.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(name) = std::env::var("MCP_SERVER_NAME") {
            config.server.name = name;
        }

        if let Ok(level) = std::env::var("MCP_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.transport = TransportConfig::from_env()?;

        let gateway = &mut config.gateway;
        if let Ok(path) = std::env::var("MCP_GATEWAY_MANIFEST") {
            gateway.manifest_path = PathBuf::from(path);
        }
        info!("Downstream manifest: {}", gateway.manifest_path.display());

        millis_from_env("MCP_POLL_INTERVAL_MS", &mut gateway.poll_interval);
        millis_from_env("MCP_CONNECT_TIMEOUT_MS", &mut gateway.connect_timeout);
        millis_from_env("MCP_DIRECTORY_TIMEOUT_MS", &mut gateway.directory_timeout);
        millis_from_env("MCP_REQUEST_TIMEOUT_MS", &mut gateway.request_timeout);
        millis_from_env("MCP_IDLE_TIMEOUT_MS", &mut gateway.idle_timeout);
        millis_from_env("MCP_CLOSE_GRACE_MS", &mut gateway.close_grace);

        if gateway.manifest_path.as_os_str().is_empty() {
            return Err(Error::config("MCP_GATEWAY_MANIFEST must not be empty"));
        }

        Ok(config)
    }
}

/// Overwrite `target` with a positive millisecond value from `var`, if set.
fn millis_from_env(var: &str, target: &mut Duration) {
    let Ok(raw) = std::env::var(var) else {
        return;
    };
    match raw.trim().parse::<u64>() {
        Ok(millis) if millis > 0 => *target = Duration::from_millis(millis),
        _ => warn!("Ignoring {}={:?}: expected a positive number of milliseconds", var, raw),
    }
}
