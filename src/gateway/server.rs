//! The gateway's own stdio server.
//!
//! Reads line-delimited JSON-RPC requests from the gateway's client and
//! answers `initialize`, `ping`, `tools/list` and `tools/call`. Calls are
//! served concurrently up to `max_concurrent`; responses are written by a
//! single writer task, one line each, in completion order.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::errors::GatewayError;
use super::router::Router;
use super::types::{
    error_codes, ClientIdentity, IncomingRequest, JsonRpcError, JsonRpcResponse, PROTOCOL_VERSION,
};

/// Outbound queue depth before request handlers wait on the writer.
const OUTBOUND_QUEUE: usize = 64;

/// Serve requests from `reader` until EOF or until `shutdown` resolves.
///
/// In-flight calls are allowed to finish (each is bounded by its call
/// timeout) and their responses are flushed before this returns.
pub async fn serve<R, W, S>(
    router: Router,
    identity: ClientIdentity,
    max_concurrent: usize,
    reader: R,
    writer: W,
    shutdown: S,
) -> Result<(), GatewayError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let (tx, rx) = mpsc::channel::<JsonRpcResponse>(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(write_responses(writer, rx));

    let limit = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let identity = Arc::new(identity);
    let mut in_flight = JoinSet::new();
    let mut lines = BufReader::new(reader).lines();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested; no longer accepting requests");
                break;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("client closed input");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read client input");
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request = match parse_request(trimmed) {
            Ok(request) => request,
            Err(response) => {
                if tx.send(response).await.is_err() {
                    tracing::warn!("error response dropped: writer closed");
                }
                continue;
            }
        };

        let Some(id) = request.id.clone() else {
            tracing::debug!(method = %request.method, "notification ignored");
            continue;
        };

        // Wait for a free slot before reading further input.
        let permit = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!(
                    method = %request.method,
                    "shutdown requested while waiting for a free slot; request not served"
                );
                break;
            }
            permit = Arc::clone(&limit).acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            break;
        };
        let router = router.clone();
        let identity = Arc::clone(&identity);
        let tx = tx.clone();
        in_flight.spawn(async move {
            let response = handle_request(&router, &identity, id, request).await;
            drop(permit);
            if tx.send(response).await.is_err() {
                tracing::warn!("response dropped: writer closed");
            }
        });

        // Reap finished handlers so the set doesn't grow unbounded.
        while in_flight.try_join_next().is_some() {}
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "request handler panicked");
        }
    }

    drop(tx);
    match writer_task.await {
        Ok(result) => result,
        Err(e) => Err(GatewayError::TransportError {
            server: "client".into(),
            reason: format!("response writer failed: {e}"),
        }),
    }
}

/// Parse one inbound line, or produce the error response for it.
fn parse_request(line: &str) -> Result<IncomingRequest, JsonRpcResponse> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
        JsonRpcResponse::failure(
            serde_json::Value::Null,
            JsonRpcError::new(error_codes::PARSE_ERROR, format!("parse error: {e}")),
        )
    })?;

    let id = value.get("id").cloned().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value).map_err(|e| {
        JsonRpcResponse::failure(
            id,
            JsonRpcError::new(error_codes::INVALID_REQUEST, format!("invalid request: {e}")),
        )
    })
}

async fn handle_request(
    router: &Router,
    identity: &ClientIdentity,
    id: serde_json::Value,
    request: IncomingRequest,
) -> JsonRpcResponse {
    let outcome = match request.method.as_str() {
        "initialize" => Ok(serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": identity.name, "version": identity.version },
        })),
        "ping" => Ok(serde_json::json!({})),
        "tools/list" => Ok(serde_json::json!({
            "tools": router.registry().available_tools(),
        })),
        "tools/call" => call_tool(router, request.params).await,
        other => Err(JsonRpcError::new(
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        )),
    };

    match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(error) => JsonRpcResponse::failure(id, error),
    }
}

async fn call_tool(
    router: &Router,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, JsonRpcError> {
    let params = params.unwrap_or(serde_json::Value::Null);
    let Some(name) = params.get("name").and_then(|n| n.as_str()) else {
        return Err(JsonRpcError::new(
            error_codes::INVALID_PARAMS,
            "tools/call requires a string 'name'",
        ));
    };
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    match router.call(name, arguments).await {
        Ok(invocation) => Ok(invocation.result),
        Err(e) => {
            tracing::warn!(tool = %name, error = %e, "tool call failed");
            Err(to_rpc_error(&e))
        }
    }
}

/// Map a routing failure onto a JSON-RPC error object.
pub fn to_rpc_error(err: &GatewayError) -> JsonRpcError {
    match err {
        GatewayError::ToolNotFound { .. } | GatewayError::InvalidArguments { .. } => {
            JsonRpcError::new(error_codes::INVALID_PARAMS, err.to_string())
        }
        GatewayError::AllBackendsFailed { attempts, last, .. } => {
            let mut data = serde_json::json!({
                "attempts": attempts,
                "lastError": last.to_string(),
            });
            if let GatewayError::Rejected {
                server,
                code,
                data: backend_data,
                ..
            } = last.as_ref()
            {
                data["backend"] = serde_json::json!(server);
                data["backendCode"] = serde_json::json!(code);
                if let Some(d) = backend_data {
                    data["backendData"] = d.clone();
                }
            }
            JsonRpcError {
                code: error_codes::INTERNAL_ERROR,
                message: err.to_string(),
                data: Some(data),
            }
        }
        _ => JsonRpcError::new(error_codes::INTERNAL_ERROR, err.to_string()),
    }
}

async fn write_responses<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<JsonRpcResponse>,
) -> Result<(), GatewayError>
where
    W: AsyncWrite + Unpin,
{
    let write_err = |e: std::io::Error| GatewayError::TransportError {
        server: "client".into(),
        reason: format!("failed to write response: {e}"),
    };

    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_string(&response).map_err(|e| GatewayError::TransportError {
            server: "client".into(),
            reason: format!("failed to serialize response: {e}"),
        })?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await.map_err(write_err)?;
        writer.flush().await.map_err(write_err)?;
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
