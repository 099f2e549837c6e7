//! Child-process channel: newline-delimited JSON over a spawned server's
//! stdin/stdout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::MessageChannel;
use super::error::{ChannelError, ChannelResult};
use super::framing::{ChannelOptions, FrameCounter, LineChannel, MessageStream};

/// Everything needed to start a downstream server process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory, if different from ours.
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables.
    pub environment: HashMap<String, String>,
}

/// A running child process wrapped in a framed channel.
pub struct ProcessChannel {
    label: String,
    channel: LineChannel,
    child: Mutex<Child>,
    pid: Option<u32>,
    close_grace: Duration,
}

impl ProcessChannel {
    /// Spawn the process and attach to its stdio.
    pub fn spawn(label: impl Into<String>, spec: &ProcessSpec, options: ChannelOptions) -> ChannelResult<Self> {
        let label = label.into();

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ChannelError::connect(&spec.command, e))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ChannelError::connect(&spec.command, std::io::Error::other("failed to capture stdin"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ChannelError::connect(&spec.command, std::io::Error::other("failed to capture stdout"))
        })?;

        let pid = child.id();
        info!(server = %label, pid = ?pid, "Spawned downstream process: {}", spec.command);

        // Idle processes are fine; only sockets time out.
        let options = options.with_idle_timeout(None);
        let channel = LineChannel::spawn(label.clone(), stdout, stdin, options, FrameCounter::default());

        Ok(Self {
            label,
            channel,
            child: Mutex::new(child),
            pid,
            close_grace: options.close_grace,
        })
    }

    /// OS process id, if the process was still running at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl MessageChannel for ProcessChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send(&self, message: &Value) -> ChannelResult<()> {
        self.channel.send(message).await
    }

    async fn subscribe(&self) -> ChannelResult<MessageStream> {
        Ok(self.channel.subscribe())
    }

    fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }

    fn dropped_frames(&self) -> u64 {
        self.channel.dropped_frames()
    }

    async fn close(&self) {
        // Closing stdin asks a well-behaved server to exit on its own.
        self.channel.close().await;

        let mut child = self.child.lock().await;
        match tokio::time::timeout(self.close_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(server = %self.label, "Process exited: {}", status),
            Ok(Err(e)) => warn!(server = %self.label, "Failed to reap process: {}", e),
            Err(_) => {
                warn!(server = %self.label, "Process did not exit, killing");
                let _ = child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cat_spec() -> ProcessSpec {
        ProcessSpec {
            command: "cat".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let spec = ProcessSpec {
            command: "nonexistent-mcp-server-12345".to_string(),
            ..Default::default()
        };
        let result = ProcessChannel::spawn("missing", &spec, ChannelOptions::default());
        assert!(matches!(result, Err(ChannelError::Connect { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_round_trip_through_cat() {
        let channel = ProcessChannel::spawn("cat", &cat_spec(), ChannelOptions::default()).unwrap();
        assert!(channel.pid().is_some());

        let mut stream = channel.subscribe().await.unwrap();
        channel.send(&json!({"jsonrpc": "2.0", "id": 7})).await.unwrap();
        assert_eq!(stream.next().await.unwrap()["id"], 7);

        channel.close().await;
        assert!(!channel.is_alive());
    }
}
