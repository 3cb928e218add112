//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with backend child processes:
//! - Writing line-delimited JSON-RPC requests to the child's stdin
//! - A background reader that matches stdout responses to pending calls by id
//! - Failing every pending call when the child hangs up

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use super::errors::GatewayError;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

// ─── Pending Calls ───────────────────────────────────────────────────────────

/// An outstanding request waiting for its response line.
struct PendingCall {
    method: String,
    deadline: Instant,
    slot: oneshot::Sender<JsonRpcResponse>,
}

/// Correlation table shared between callers and the reader task.
#[derive(Default)]
struct PendingTable {
    calls: HashMap<u64, PendingCall>,
    /// Set once the channel is gone; holds the reason.
    closed: Option<String>,
}

type SharedTable = Arc<Mutex<PendingTable>>;

fn lock_table(table: &SharedTable) -> MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mark the table closed and drop every pending slot, waking their callers.
fn close_table(table: &SharedTable, reason: String) -> usize {
    let mut guard = lock_table(table);
    if guard.closed.is_none() {
        guard.closed = Some(reason);
    }
    let dropped = guard.calls.len();
    guard.calls.clear();
    dropped
}

/// Releases a call's slot when the caller stops waiting (timeout or cancel).
struct PendingGuard<'a> {
    table: &'a SharedTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_table(self.table).calls.remove(&self.id);
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bi-directional JSON-RPC transport over a child process's stdio.
///
/// Many calls may be in flight at once; each gets a unique id and the reader
/// task hands responses back by id, in whatever order they arrive.
pub struct StdioTransport {
    server_name: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: SharedTable,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport from the child's stdout (`reader`) and stdin (`writer`).
    ///
    /// Must be called inside a tokio runtime: the reader task starts here.
    pub fn new<R, W>(server_name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: SharedTable = Arc::new(Mutex::new(PendingTable::default()));
        let reader_task = tokio::spawn(reader_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&pending),
        ));

        Self {
            server_name: server_name.to_string(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            reader_task,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Whether the channel has closed. Once closed it never reopens.
    pub fn is_closed(&self) -> bool {
        lock_table(&self.pending).closed.is_some()
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock_table(&self.pending).calls.len()
    }

    /// Send a request and wait for the response carrying the same id.
    ///
    /// On timeout the call is abandoned: its slot is released and a late
    /// response is discarded by the reader.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let deadline = Instant::now() + timeout;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (slot, response_rx) = oneshot::channel();
        {
            let mut table = lock_table(&self.pending);
            if let Some(reason) = &table.closed {
                return Err(self.closed_error(reason.clone()));
            }
            table.calls.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    deadline,
                    slot,
                },
            );
        }
        let _guard = PendingGuard {
            table: &self.pending,
            id,
        };

        let line = encode_line(&self.server_name, &JsonRpcRequest::new(id, method, params))?;

        self.write_line(&line, method, deadline, timeout).await?;

        match timeout_at(deadline, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(self.closed_error(self.close_reason())),
            Err(_) => {
                tracing::debug!(
                    backend = %self.server_name,
                    id,
                    method,
                    "abandoning call after deadline"
                );
                Err(self.timeout_error(method, timeout))
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        if let Some(reason) = lock_table(&self.pending).closed.clone() {
            return Err(self.closed_error(reason));
        }

        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        let line = encode_line(&self.server_name, &notification)?;

        self.write_line(&line, method, Instant::now() + timeout, timeout)
            .await
    }

    /// Write one frame before `deadline`.
    ///
    /// Waiting for the writer lock may time out harmlessly. Once bytes start
    /// going out, a timeout can leave half a frame in the child's stdin, so
    /// the channel is closed rather than letting the next frame run into it.
    async fn write_line(
        &self,
        line: &str,
        method: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let Ok(mut writer) = timeout_at(deadline, self.writer.lock()).await else {
            return Err(self.timeout_error(method, timeout));
        };

        let written = timeout_at(deadline, async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        })
        .await;

        let reason = match written {
            Ok(Ok(())) => return Ok(()),
            // A broken stdin pipe means the backend is gone.
            Ok(Err(e)) => format!("failed to write to stdin: {e}"),
            Err(_) => format!(
                "write of '{method}' stalled for {}ms; stdin frame is incomplete",
                timeout.as_millis()
            ),
        };
        let dropped = close_table(&self.pending, reason.clone());
        tracing::warn!(
            backend = %self.server_name,
            method,
            pending = dropped,
            reason = %reason,
            "closing transport after failed write"
        );
        Err(self.closed_error(reason))
    }

    fn close_reason(&self) -> String {
        lock_table(&self.pending)
            .closed
            .clone()
            .unwrap_or_else(|| "response slot dropped".to_string())
    }

    fn closed_error(&self, reason: String) -> GatewayError {
        GatewayError::ChannelClosed {
            server: self.server_name.clone(),
            reason,
        }
    }

    fn timeout_error(&self, method: &str, timeout: Duration) -> GatewayError {
        GatewayError::Timeout {
            server: self.server_name.clone(),
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn encode_line<T: serde::Serialize>(server: &str, message: &T) -> Result<String, GatewayError> {
    let mut json = serde_json::to_string(message).map_err(|e| GatewayError::TransportError {
        server: server.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })?;
    json.push('\n');
    Ok(json)
}

// ─── Reader ──────────────────────────────────────────────────────────────────

async fn reader_loop<R>(server_name: String, reader: R, pending: SharedTable)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch_line(&server_name, &pending, &line),
            Ok(None) => break "stdout closed (process may have exited)".to_string(),
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    let dropped = close_table(&pending, reason.clone());
    tracing::debug!(
        backend = %server_name,
        reason = %reason,
        pending = dropped,
        "transport reader stopped"
    );
}

/// Route one stdout line to the call that owns its id.
fn dispatch_line(server_name: &str, pending: &SharedTable, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => {
            // Not JSON; most likely stray log output on stdout.
            tracing::debug!(backend = %server_name, line = %trimmed, "skipping non-JSON stdout line");
            return;
        }
    };

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        tracing::debug!(
            backend = %server_name,
            method,
            "ignoring backend-initiated message"
        );
        return;
    }

    let response: JsonRpcResponse = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(backend = %server_name, error = %e, "skipping malformed response");
            return;
        }
    };

    let Some(id) = response_id(&response.id) else {
        tracing::debug!(backend = %server_name, id = %response.id, "response without usable id");
        return;
    };

    let call = lock_table(pending).calls.remove(&id);
    match call {
        Some(call) => {
            if Instant::now() > call.deadline {
                tracing::debug!(backend = %server_name, id, method = %call.method, "late response");
            }
            // The caller may have just given up; nothing to do then.
            let _ = call.slot.send(response);
        }
        None => {
            tracing::debug!(
                backend = %server_name,
                id,
                "discarding response for unknown or abandoned call"
            );
        }
    }
}

fn response_id(id: &serde_json::Value) -> Option<u64> {
    id.as_u64()
        .or_else(|| id.as_str().and_then(|s| s.parse().ok()))
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `Rejected`.
pub fn extract_result(
    server: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, GatewayError> {
    if let Some(err) = response.error {
        return Err(GatewayError::Rejected {
            server: server.to_string(),
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or_else(|| GatewayError::Rejected {
        server: server.to_string(),
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
