//! Core module containing the gateway's shared infrastructure.
//!
//! Configuration, the unified error type, the [`Gateway`] context object,
//! the outward MCP handler and the transport layer.

pub mod config;
pub mod error;
pub mod gateway;
pub mod server;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use server::GatewayServer;
pub use transport::{TransportConfig, TransportService};
