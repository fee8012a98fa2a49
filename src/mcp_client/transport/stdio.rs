//! JSON-RPC over stdio transport.
//!
//! Spawns the server as a child process and speaks line-delimited JSON:
//! - requests and notifications are written to stdin, one object per line
//! - a background reader parses stdout and dispatches every message
//! - stderr is drained into tracing and kept as error context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{HandlerSlot, Transport, TransportHandlers};
use crate::config::{ServerConfig, ServerType};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::lifecycle::{self, StderrTail};
use crate::mcp_client::types::JsonRpcMessage;

/// Live process state; present only between connect and disconnect.
struct StdioProcess {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
    stderr_drain: Option<JoinHandle<()>>,
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    config: ServerConfig,
    handlers: Arc<HandlerSlot>,
    process: Mutex<Option<StdioProcess>>,
    /// Set while we are tearing the process down, so EOF is not an error.
    closing: Arc<AtomicBool>,
    stderr_tail: StderrTail,
}

impl StdioTransport {
    pub fn new(config: &ServerConfig) -> Result<Self, McpError> {
        if config.command.is_none() {
            return Err(McpError::SpawnFailed {
                name: config.name.clone(),
                reason: "no command configured".into(),
            });
        }
        Ok(Self {
            config: config.clone(),
            handlers: Arc::new(HandlerSlot::default()),
            process: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            stderr_tail: StderrTail::default(),
        })
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    /// Recent stderr output, for diagnostics.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.snapshot()
    }

    fn spawn_reader(&self, stdout: ChildStdout) -> JoinHandle<()> {
        let server = self.config.name.clone();
        let handlers = self.handlers.clone();
        let closing = self.closing.clone();
        let tail = self.stderr_tail.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcMessage>(trimmed) {
                            Ok(message) => handlers.get().dispatch(message),
                            Err(_) => {
                                // Not JSON-RPC; servers sometimes print banners to stdout.
                                tracing::debug!(server = %server, line = %trimmed, "skipping non-JSON stdout line");
                            }
                        }
                    }
                    Ok(None) => break "server stdout closed (process may have exited)".to_string(),
                    Err(e) => break format!("failed to read from stdout: {e}"),
                }
            };

            if !closing.load(Ordering::SeqCst) {
                tracing::warn!(server = %server, reason = %reason, "stdio reader stopped");
                handlers
                    .get()
                    .report(McpError::connection(&server, format!("{reason}{}", tail.suffix())));
            }
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<(), McpError> {
        let mut guard = self.process.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        self.closing.store(false, Ordering::SeqCst);

        let mut child = lifecycle::spawn_process(&self.config)?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: self.name().to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: self.name().to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr_drain = child
            .stderr
            .take()
            .map(|stderr| lifecycle::spawn_stderr_drain(self.name(), stderr, self.stderr_tail.clone()));

        let reader = self.spawn_reader(stdout);

        *guard = Some(StdioProcess {
            child,
            stdin,
            reader,
            stderr_drain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        let Some(process) = self.process.lock().await.take() else {
            return Ok(());
        };
        self.closing.store(true, Ordering::SeqCst);

        let StdioProcess {
            mut child,
            stdin,
            reader,
            stderr_drain,
        } = process;

        // Closing stdin is the polite shutdown signal for most servers.
        drop(stdin);
        lifecycle::terminate_child(self.name(), &mut child).await;

        reader.abort();
        if let Some(drain) = stderr_drain {
            drain.abort();
        }
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<Option<JsonRpcMessage>, McpError> {
        let mut line = serde_json::to_string(&message).map_err(|e| {
            McpError::connection(self.name(), format!("failed to serialize message: {e}"))
        })?;
        line.push('\n');

        let mut guard = self.process.lock().await;
        let process = guard
            .as_mut()
            .ok_or_else(|| McpError::connection(self.name(), "transport is not connected"))?;

        let write = async {
            process.stdin.write_all(line.as_bytes()).await?;
            process.stdin.flush().await
        };
        if let Err(e) = write.await {
            let err = McpError::connection(
                self.name(),
                format!("failed to write to stdin: {e}{}", self.stderr_tail.suffix()),
            );
            self.handlers.get().report(McpError::connection(self.name(), e.to_string()));
            return Err(err);
        }
        Ok(None)
    }

    async fn is_healthy(&self) -> bool {
        let mut guard = self.process.lock().await;
        match guard.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.handlers.set(handlers);
    }

    fn kind(&self) -> ServerType {
        ServerType::Stdio
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
