//! MCP Gateway Library
//!
//! This crate aggregates the tools of many downstream Model Context Protocol
//! servers behind a single MCP endpoint. Tools are exposed under qualified
//! names (`<server>/<tool>`), validated against their declared parameter
//! schemas and routed to the owning server over a shared, lazily opened
//! connection.
//!
//! # Architecture
//!
//! - **core**: configuration, error handling, the [`Gateway`] context, the
//!   outward MCP handler and its transports
//! - **domains**: business logic, leaf first
//!   - **channel**: newline-delimited JSON-RPC over a child process or a local socket
//!   - **directory**: which downstream servers exist, and how to launch them
//!   - **connections**: one shared, initialized connection per server
//!   - **tools**: schema translation, descriptors, discovery and call routing
//!   - **registry**: immutable aggregated generations and the hot-reload poller
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp_gateway::core::{Config, Gateway, GatewayServer, TransportService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let gateway = Gateway::from_manifest(config.clone());
//!     let poller = gateway.start().await;
//!
//!     TransportService::new(config.transport)
//!         .run(GatewayServer::new(gateway.clone()))
//!         .await?;
//!
//!     gateway.shutdown().await;
//!     poller.await?;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod domains;

#[cfg(all(test, unix))]
mod testing;

// Re-export commonly used types for convenience
pub use core::{Config, Error, Gateway, GatewayServer, Result};
