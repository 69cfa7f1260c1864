#[cfg(test)]
#[path = "stdio_test.rs"]
mod tests;

use async_trait::async_trait;
use std::{collections::HashMap, process::Stdio as ProcessStdio};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, Command},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ServerConfig, expand_env},
    mcp::McpError,
    models::Message,
};

use super::Transport;

/// Newline-delimited JSON over a child process's stdin/stdout.
pub struct Stdio {
    name: String,
    stdin: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    stdout: Mutex<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
    process: Option<Mutex<Child>>, // None when wrapping plain streams
    closed: CancellationToken,
}

impl Stdio {
    pub fn new(config: &ServerConfig) -> Result<Self, McpError> {
        let command = config.command().ok_or_else(|| {
            McpError::InvalidConfig(format!("server {} has no command", config.name()))
        })?;

        let mut envs = HashMap::new();
        for (key, value) in config.env() {
            let value = expand_env(value)
                .map_err(|e| McpError::InvalidConfig(format!("expanding env {}: {}", key, e)))?;
            envs.insert(key.clone(), value);
        }

        let mut process = Command::new(command)
            .args(config.args())
            .envs(envs)
            .stdin(ProcessStdio::piped())
            .stdout(ProcessStdio::piped())
            .stderr(ProcessStdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("failed to open stdin".to_string()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("failed to open stdout".to_string()))?;
        if let Some(stderr) = process.stderr.take() {
            forward_stderr(config.name().to_string(), stderr);
        }

        log::debug!(
            "Spawned MCP server {} (pid {:?}): {} {:?}",
            config.name(),
            process.id(),
            command,
            config.args()
        );

        let mut transport = Self::from_io(config.name(), stdout, stdin);
        transport.process = Some(Mutex::new(process));
        Ok(transport)
    }

    /// Wraps an already connected pair of streams.
    pub fn from_io(
        name: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            stdin: Mutex::new(Box::new(writer)),
            stdout: Mutex::new(BufReader::new(Box::new(reader))),
            process: None,
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transport for Stdio {
    async fn send(&self, message: &Message) -> Result<(), McpError> {
        if self.closed.is_cancelled() {
            return Err(McpError::Closed);
        }
        let line = serde_json::to_string(message).map_err(McpError::Encode)? + "\n";

        // A peer that stops reading must not keep close waiting on the lock
        tokio::select! {
            _ = self.closed.cancelled() => Err(McpError::Closed),
            written = async {
                let mut stdin = self.stdin.lock().await;
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            } => Ok(written?),
        }
    }

    async fn receive(&self) -> Result<Message, McpError> {
        let mut stdout = tokio::select! {
            _ = self.closed.cancelled() => return Err(McpError::Closed),
            stdout = self.stdout.lock() => stdout,
        };

        let mut line = Vec::new();
        loop {
            line.clear();
            let read = tokio::select! {
                _ = self.closed.cancelled() => return Err(McpError::Closed),
                read = stdout.read_until(b'\n', &mut line) => read?,
            };
            if read == 0 {
                return Err(McpError::Disconnected);
            }

            let raw = line.trim_ascii();
            if raw.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Message>(raw) {
                Ok(message) => return Ok(message),
                Err(err) => log::warn!(
                    "[{}] skipping non JSON-RPC line ({}): {}",
                    self.name,
                    err,
                    String::from_utf8_lossy(raw)
                ),
            }
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        if let Err(err) = self.stdin.lock().await.shutdown().await {
            log::debug!("[{}] closing stdin: {}", self.name, err);
        }

        if let Some(process) = &self.process {
            let mut process = process.lock().await;
            if process.try_wait()?.is_none() {
                process.kill().await?;
            }
        }
        Ok(())
    }
}

fn forward_stderr(name: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::info!("[{}] {}", name, line);
        }
    });
}
