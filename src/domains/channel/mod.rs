//! Downstream message channels.
//!
//! A channel carries discrete JSON messages in both directions between the
//! gateway and one downstream server, framed as newline-delimited JSON:
//!
//! - [`SocketChannel`]: a local (Unix domain) socket, connected lazily
//! - [`ProcessChannel`]: the stdin/stdout of a spawned child process
//!
//! Both sit on top of [`LineChannel`], which owns the framing, the inbound
//! reader task and the liveness state.

mod error;
mod framing;
mod process;
#[cfg(unix)]
mod socket;

use async_trait::async_trait;
use serde_json::Value;

pub use error::{ChannelError, ChannelResult};
pub use framing::{ChannelOptions, FrameCounter, LineChannel, MessageStream};
pub use process::{ProcessChannel, ProcessSpec};
#[cfg(unix)]
pub use socket::SocketChannel;

/// A duplex channel of JSON messages.
///
/// Incoming traffic is consumed through [`MessageChannel::subscribe`]; each
/// subscription is an open-ended sequence that ends when the connection
/// does.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Name used in logs.
    fn label(&self) -> String;

    /// Send one message. Connects first if the channel supports it.
    async fn send(&self, message: &Value) -> ChannelResult<()>;

    /// Subscribe to inbound messages.
    async fn subscribe(&self) -> ChannelResult<MessageStream>;

    /// Cheap, non-blocking check that the channel is writable and not torn down.
    fn is_alive(&self) -> bool;

    /// Inbound lines dropped because they did not parse as JSON.
    fn dropped_frames(&self) -> u64;

    /// Tear the channel down. Always returns.
    async fn close(&self);
}
