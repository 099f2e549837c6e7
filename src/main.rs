//! MCP Gateway Entry Point
//!
//! Initializes logging, loads configuration, builds the first registry
//! generation and serves it on the configured transport until the client
//! disconnects or the process is interrupted.

use anyhow::Result;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use mcp_gateway::core::{Config, Gateway, GatewayServer, TransportService};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment
    let config = Config::from_env()?;

    // Initialize logging
    init_logging(&config.logging.level);

    info!("Starting {} v{}", config.server.name, config.server.version);

    let gateway = Gateway::from_manifest(config.clone());
    let poller = gateway.start().await;

    let server = GatewayServer::new(gateway.clone());
    let transport = TransportService::new(config.transport);

    tokio::select! {
        result = transport.run(server) => {
            if let Err(e) = result {
                warn!("Transport stopped with an error: {}", e);
                gateway.shutdown().await;
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    info!("Gateway shutting down");
    gateway.shutdown().await;
    poller.await?;

    Ok(())
}

/// Initialize the logging subsystem.
///
/// Logs always go to stderr; stdout carries protocol frames in STDIO mode.
fn init_logging(level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}
