//! Local-socket channel with lazy, idempotent connects.
//!
//! `connect` may be called any number of times and from any number of tasks:
//! while an attempt is in flight every caller awaits that same attempt, and
//! once connected the live channel is reused until it dies.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, instrument};

use super::MessageChannel;
use super::error::{ChannelError, ChannelResult};
use super::framing::{ChannelOptions, FrameCounter, LineChannel, MessageStream};

type ConnectOutcome = Result<Arc<LineChannel>, Arc<std::io::Error>>;
type PendingConnect = Shared<BoxFuture<'static, ConnectOutcome>>;

/// A duplex JSON message channel to a local (Unix domain) socket.
pub struct SocketChannel {
    address: PathBuf,
    connect_timeout: Duration,
    options: ChannelOptions,
    dropped: FrameCounter,
    current: watch::Sender<Option<Arc<LineChannel>>>,
    pending: Mutex<Option<PendingConnect>>,
}

impl SocketChannel {
    /// Create an unconnected channel for `address`.
    pub fn new(address: impl Into<PathBuf>, connect_timeout: Duration, options: ChannelOptions) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            address: address.into(),
            connect_timeout,
            options,
            dropped: FrameCounter::default(),
            current,
            pending: Mutex::new(None),
        }
    }

    /// Socket path this channel talks to.
    pub fn address(&self) -> &Path {
        &self.address
    }

    fn live_channel(&self) -> Option<Arc<LineChannel>> {
        self.current
            .borrow()
            .as_ref()
            .filter(|channel| channel.is_alive())
            .cloned()
    }

    /// Connect, or join the connect already in flight.
    #[instrument(skip(self), fields(address = %self.address.display()))]
    pub async fn connect(&self) -> ChannelResult<Arc<LineChannel>> {
        let attempt = {
            let mut pending = self.pending.lock().await;
            if let Some(channel) = self.live_channel() {
                return Ok(channel);
            }
            match pending.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let attempt = open(
                        self.address.clone(),
                        self.connect_timeout,
                        self.options,
                        self.dropped.clone(),
                    )
                    .boxed()
                    .shared();
                    *pending = Some(attempt.clone());
                    attempt
                }
            }
        };

        let outcome = attempt.clone().await;

        {
            let mut pending = self.pending.lock().await;
            // Only the first waiter back publishes the result.
            if pending.as_ref().is_some_and(|current| current.ptr_eq(&attempt)) {
                *pending = None;
                if let Ok(channel) = &outcome {
                    self.current.send_replace(Some(channel.clone()));
                }
            }
        }

        outcome.map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                ChannelError::ConnectTimeout(self.address.display().to_string())
            } else {
                ChannelError::connect(
                    self.address.display().to_string(),
                    std::io::Error::new(e.kind(), e.to_string()),
                )
            }
        })
    }
}

async fn open(
    address: PathBuf,
    connect_timeout: Duration,
    options: ChannelOptions,
    dropped: FrameCounter,
) -> ConnectOutcome {
    let stream = match tokio::time::timeout(connect_timeout, UnixStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(Arc::new(e)),
        Err(_) => {
            return Err(Arc::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )));
        }
    };

    let label = address.display().to_string();
    info!("Connected to socket {}", label);

    let (read_half, write_half) = stream.into_split();
    Ok(Arc::new(LineChannel::spawn(
        label, read_half, write_half, options, dropped,
    )))
}

#[async_trait]
impl MessageChannel for SocketChannel {
    fn label(&self) -> String {
        self.address.display().to_string()
    }

    async fn send(&self, message: &Value) -> ChannelResult<()> {
        let channel = self.connect().await?;
        channel.send(message).await
    }

    async fn subscribe(&self) -> ChannelResult<MessageStream> {
        Ok(self.connect().await?.subscribe())
    }

    fn is_alive(&self) -> bool {
        self.live_channel().is_some()
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped.get()
    }

    async fn close(&self) {
        if let Some(channel) = self.current.send_replace(None) {
            debug!("Closing socket {}", self.address.display());
            channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    fn channel_for(path: &Path) -> SocketChannel {
        SocketChannel::new(
            path,
            Duration::from_secs(2),
            ChannelOptions::default().with_close_grace(Duration::from_millis(200)),
        )
    }

    /// Accepts connections and echoes every line back, counting accepts.
    fn spawn_echo(listener: UnixListener) -> Arc<AtomicUsize> {
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if write_half.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        accepted
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let accepted = spawn_echo(UnixListener::bind(&path).unwrap());

        let channel = channel_for(&path);
        let (a, b) = tokio::join!(channel.connect(), channel.connect());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_connects_transparently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        spawn_echo(UnixListener::bind(&path).unwrap());

        let channel = channel_for(&path);
        assert!(!channel.is_alive());

        let mut stream = channel.subscribe().await.unwrap();
        channel.send(&json!({"hello": "world"})).await.unwrap();
        assert_eq!(stream.next().await.unwrap()["hello"], "world");
        assert!(channel.is_alive());
    }

    #[tokio::test]
    async fn test_connect_failure_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel_for(&dir.path().join("missing.sock"));

        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_broken_pipe_then_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flaky.sock");
        let listener = UnixListener::bind(&path).unwrap();

        // First peer accepts and immediately hangs up.
        let first = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
            listener
        });

        let channel = channel_for(&path);
        let line = channel.connect().await.unwrap();
        let listener = first.await.unwrap();

        // Keep writing on the original connection until the dead peer shows.
        let mut failure = None;
        for _ in 0..50 {
            match line.send(&json!({"ping": true})).await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let failure = failure.expect("write to a closed peer must fail");
        assert!(failure.is_connection_lost());
        assert!(!channel.is_alive());

        // A fresh connection can be established afterwards.
        spawn_echo(listener);
        let mut stream = channel.subscribe().await.unwrap();
        channel.send(&json!({"again": 1})).await.unwrap();
        assert_eq!(stream.next().await.unwrap()["again"], 1);
    }

    #[tokio::test]
    async fn test_close_then_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        spawn_echo(UnixListener::bind(&path).unwrap());

        let channel = channel_for(&path);
        channel.connect().await.unwrap();
        assert!(channel.is_alive());

        channel.close().await;
        assert!(!channel.is_alive());
    }
}
