//! Downstream connections.
//!
//! [`ConnectionManager`] keeps at most one [`Connection`] per downstream
//! server and re-establishes it transparently when it dies. Each connection
//! wraps a [`DownstreamClient`] speaking JSON-RPC over a message channel.

mod client;
mod error;
mod manager;
mod protocol;

pub use client::DownstreamClient;
pub use error::{ConnectionError, ConnectionResult};
pub use manager::{Connection, ConnectionManager, ConnectionSettings};
pub use protocol::{Inbound, JsonRpcError, PROTOCOL_VERSION, ToolInfo};
