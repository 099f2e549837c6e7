//! Newline-delimited JSON framing over any duplex byte stream.
//!
//! Every message is one complete JSON document followed by a single `\n`.
//! There is no length prefix. Standard JSON string escaping guarantees a
//! serialized message never contains a literal newline.
//!
//! Incoming bytes are buffered by a background reader task and split on
//! newline boundaries. Each complete line is parsed and broadcast to every
//! [`MessageStream`] subscribed at that point. Lines that do not parse are
//! dropped and counted; they never take the connection down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::error::{ChannelError, ChannelResult};

/// Capacity of the per-channel broadcast buffer for inbound messages.
const INBOUND_CAPACITY: usize = 256;

// ============================================================================
// Options
// ============================================================================

/// Tunables for a framed channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// Tear the channel down when nothing arrives for this long.
    pub idle_timeout: Option<Duration>,

    /// Upper bound for a single framed write (including flush).
    pub write_timeout: Duration,

    /// How long `close` waits for the peer to acknowledge the half-close.
    pub close_grace: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            write_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(2),
        }
    }
}

impl ChannelOptions {
    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the close grace period.
    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }
}

/// Shared counter of inbound lines that failed to parse.
#[derive(Debug, Clone, Default)]
pub struct FrameCounter(Arc<AtomicU64>);

impl FrameCounter {
    /// Current count.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// ============================================================================
// Message Stream
// ============================================================================

/// A subscription to the inbound messages of one connection.
///
/// The stream yields every message received after it was created and ends
/// once the underlying connection is closed. Subscribing again after a
/// reconnect yields the messages of the new connection.
pub struct MessageStream {
    inbound: broadcast::Receiver<Value>,
    closed: watch::Receiver<bool>,
}

impl MessageStream {
    /// Wait for the next inbound message. `None` means the connection is gone.
    pub async fn next(&mut self) -> Option<Value> {
        loop {
            tokio::select! {
                biased;
                received = self.inbound.recv() => match received {
                    Ok(message) => return Some(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscriber lagged, {} inbound messages skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = self.closed.wait_for(|closed| *closed) => {
                    // Drain what was buffered before the close.
                    return self.inbound.try_recv().ok();
                }
            }
        }
    }
}

// ============================================================================
// Line Channel
// ============================================================================

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected, framed duplex channel.
pub struct LineChannel {
    label: String,
    writer: Mutex<Option<BoxedWriter>>,
    inbound: broadcast::Sender<Value>,
    closed: watch::Receiver<bool>,
    closing: AtomicBool,
    dropped: FrameCounter,
    reader: AbortHandle,
    options: ChannelOptions,
}

impl std::fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineChannel")
            .field("label", &self.label)
            .field("alive", &self.is_alive())
            .field("dropped_frames", &self.dropped.get())
            .finish()
    }
}

impl LineChannel {
    /// Wrap an already-connected reader/writer pair and start reading.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<R, W>(
        label: impl Into<String>,
        reader: R,
        writer: W,
        options: ChannelOptions,
        dropped: FrameCounter,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (closed_tx, closed) = watch::channel(false);

        let task = tokio::spawn(read_loop(
            label.clone(),
            reader,
            inbound.clone(),
            closed_tx,
            dropped.clone(),
            options.idle_timeout,
        ));

        Self {
            label,
            writer: Mutex::new(Some(Box::new(writer))),
            inbound,
            closed,
            closing: AtomicBool::new(false),
            dropped,
            reader: task.abort_handle(),
            options,
        }
    }

    /// Human-readable name used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Non-blocking liveness check: not closing, reader still running.
    pub fn is_alive(&self) -> bool {
        if self.closing.load(Ordering::Acquire) {
            return false;
        }
        // A dropped sender means the reader task is gone.
        self.closed.has_changed().is_ok() && !*self.closed.borrow()
    }

    /// Number of inbound lines dropped because they were not valid JSON.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.get()
    }

    /// Subscribe to inbound messages.
    pub fn subscribe(&self) -> MessageStream {
        MessageStream {
            inbound: self.inbound.subscribe(),
            closed: self.closed.clone(),
        }
    }

    /// Serialize `message`, append the delimiter and write it as one frame.
    pub async fn send(&self, message: &Value) -> ChannelResult<()> {
        if !self.is_alive() {
            return Err(ChannelError::NotWritable);
        }

        let mut frame = serde_json::to_vec(message)?;
        frame.push(b'\n');

        let mut guard = self.writer.lock().await;
        // The channel may have died while we waited for the lock.
        if !self.is_alive() {
            return Err(ChannelError::NotWritable);
        }
        let writer = guard.as_mut().ok_or(ChannelError::NotWritable)?;

        let outcome = tokio::time::timeout(
            self.options.write_timeout,
            write_frame(writer, &frame),
        )
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                let err = ChannelError::from_write(e);
                if err.is_connection_lost() {
                    warn!(channel = %self.label, "Peer closed the connection: {}", err);
                    self.closing.store(true, Ordering::Release);
                    guard.take();
                }
                Err(err)
            }
            Err(_) => {
                let millis = u64::try_from(self.options.write_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(channel = %self.label, "Write stalled for {}ms, giving up", millis);
                self.closing.store(true, Ordering::Release);
                guard.take();
                Err(ChannelError::WriteStalled(millis))
            }
        }
    }

    /// Half-close the write side, wait briefly for the peer to close its
    /// side, then force the reader down. Always returns.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Release);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(self.options.close_grace, writer.shutdown()).await;
        }

        let mut closed = self.closed.clone();
        let graceful =
            tokio::time::timeout(self.options.close_grace, closed.wait_for(|closed| *closed)).await;

        if !matches!(graceful, Ok(Ok(_))) {
            debug!(channel = %self.label, "No close acknowledgment, destroying");
            self.reader.abort();
        }
    }
}

impl Drop for LineChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_frame(writer: &mut BoxedWriter, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn read_loop<R>(
    label: String,
    reader: R,
    inbound: broadcast::Sender<Value>,
    closed: watch::Sender<bool>,
    dropped: FrameCounter,
    idle_timeout: Option<Duration>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line);
        let outcome = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    info!(channel = %label, "Idle for {}s, tearing down", limit.as_secs());
                    break;
                }
            },
            None => read.await,
        };

        match outcome {
            Ok(0) => {
                debug!(channel = %label, "Peer closed the stream");
                break;
            }
            Ok(_) if line.last() != Some(&b'\n') => {
                // Partial frame cut off by EOF.
                dropped.bump();
            }
            Ok(_) => dispatch_line(&label, &line, &inbound, &dropped),
            Err(e) => {
                warn!(channel = %label, "Read failed: {}", e);
                break;
            }
        }
    }

    closed.send_replace(true);
}

fn dispatch_line(
    label: &str,
    line: &[u8],
    inbound: &broadcast::Sender<Value>,
    dropped: &FrameCounter,
) {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return;
    }

    match serde_json::from_slice::<Value>(trimmed) {
        Ok(message) => {
            // No subscribers is fine; nobody is waiting for this message.
            let _ = inbound.send(message);
        }
        Err(e) => {
            let total = dropped.bump();
            debug!(channel = %label, dropped = total, "Dropping unparseable frame: {}", e);
        }
    }
}
