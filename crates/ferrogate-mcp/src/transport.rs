//! MCP transports (§4.9). One `McpTransport` impl per `ConnType`: a fully
//! capable stdio transport (child process, line-framed JSON-RPC), an HTTP
//! transport (stateless request/response over POST), and SSE/in-process
//! transports filled in to the extent their `ConnType` requires.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("MCP server process has exited")]
    ProcessExited,
    #[error("timeout waiting for response")]
    Timeout,
    #[error("HTTP transport error: {0}")]
    Http(String),
    #[error("transport not supported: {0}")]
    Unsupported(String),
}

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError>;

    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    async fn shutdown(&self);
}

// ---- Stdio ------------------------------------------------------------

const MAX_SKIP_LINES: usize = 1000;

/// Spawns a child process and exchanges newline-delimited JSON-RPC over its
/// stdin/stdout.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioTransport {
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io_err("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_err("failed to capture child stdout"))?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Skips empty or non-JSON lines (e.g. a misconfigured server logging to
    /// stdout), giving up after [`MAX_SKIP_LINES`].
    async fn read_line(&self) -> Result<String, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let n = stdout.read_line(&mut line).await?;
            if n == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(io_err("too many non-JSON lines on stdout").into());
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON line from MCP server stdout");
        }
    }
}

fn io_err(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, msg.to_string())
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        // Serializes the full request/response cycle so concurrent callers
        // cannot read each other's responses.
        let _guard = self.request_lock.lock().await;

        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        self.write_line(&serde_json::to_string(&req)?).await?;

        let result = tokio::time::timeout(tokio::time::Duration::from_secs(30), async {
            loop {
                let line = self.read_line().await?;
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&line)
                    && resp.id == id
                {
                    return Ok(resp);
                }
                tracing::debug!(line = %line, "skipping non-matching message from MCP server");
            }
        })
        .await;

        result.unwrap_or(Err(TransportError::Timeout))
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        self.write_line(&serde_json::to_string(&notif)?).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        match tokio::time::timeout(tokio::time::Duration::from_secs(5), child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "error waiting for MCP server process"),
            Err(_) => {
                tracing::warn!("MCP server process did not exit within timeout, killing");
                let _ = child.kill().await;
            }
        }
    }
}

// ---- HTTP ---------------------------------------------------------------

/// Stateless request/response JSON-RPC over a single HTTP POST endpoint; no
/// persistent connection is held, so `is_alive` is a liveness probe rather
/// than a connection flag.
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let res = self
            .client
            .post(&self.endpoint)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                self.alive.store(false, Ordering::SeqCst);
                TransportError::Http(e.to_string())
            })?;

        res.json::<JsonRpcResponse>()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        self.client
            .post(&self.endpoint)
            .json(&notif)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

// ---- SSE / In-process ----------------------------------------------------

/// SSE event-stream transport. Filled in to the extent the four `ConnType`
/// variants require; a full bidirectional SSE+POST session is not yet
/// implemented.
pub struct SseTransport {
    alive: AtomicBool,
}

impl SseTransport {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(false),
        }
    }
}

impl Default for SseTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send_request(
        &self,
        _method: &str,
        _params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        Err(TransportError::Unsupported(
            "SSE transport is not yet implemented".into(),
        ))
    }

    async fn send_notification(&self, _method: &str) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(
            "SSE transport is not yet implemented".into(),
        ))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {}
}

/// Direct in-process dispatch to a Rust closure, for tools implemented by
/// the host process rather than a separate server (tests, built-in tools).
pub struct InProcessTransport<F>
where
    F: Fn(&str, Option<Value>) -> Result<Value, TransportError> + Send + Sync,
{
    handler: F,
    alive: AtomicBool,
}

impl<F> InProcessTransport<F>
where
    F: Fn(&str, Option<Value>) -> Result<Value, TransportError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            alive: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl<F> McpTransport for InProcessTransport<F>
where
    F: Fn(&str, Option<Value>) -> Result<Value, TransportError> + Send + Sync,
{
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = 0;
        match (self.handler)(method, params) {
            Ok(result) => Ok(JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: Some(result),
                error: None,
            }),
            Err(e) => Ok(JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: None,
                error: Some(crate::protocol::JsonRpcError {
                    code: -32000,
                    message: e.to_string(),
                    data: None,
                }),
            }),
        }
    }

    async fn send_notification(&self, _method: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}
