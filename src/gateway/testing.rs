//! In-memory backends for unit tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::config::BackendDescriptor;
use super::connection::BackendConnection;
use super::protocol::ProtocolClient;
use super::transport::StdioTransport;
use super::types::ClientIdentity;

/// How the fake backend answers one request.
pub(crate) enum Reply {
    Result(serde_json::Value),
    Error(i32, String),
    /// Never answer.
    Silent,
    /// Close both pipes, as if the process died.
    Hangup,
}

/// Transport whose far side is a task answering requests with `handler`.
///
/// Notifications are passed to the handler too; their reply is ignored.
pub(crate) fn fake_transport<F>(name: &str, handler: F) -> StdioTransport
where
    F: Fn(&str, &serde_json::Value) -> Reply + Send + Sync + 'static,
{
    let (gateway_side, backend_side) = tokio::io::duplex(64 * 1024);
    let (g_read, g_write) = tokio::io::split(gateway_side);

    tokio::spawn(async move {
        let (b_read, mut b_write) = tokio::io::split(backend_side);
        let mut lines = BufReader::new(b_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(msg) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            let method = msg["method"].as_str().unwrap_or_default().to_string();
            let params = msg.get("params").cloned().unwrap_or(serde_json::Value::Null);
            let reply = handler(&method, &params);

            let Some(id) = msg.get("id").cloned() else {
                continue;
            };
            let out = match reply {
                Reply::Result(result) => serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Reply::Error(code, message) => serde_json::json!({
                    "jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}
                }),
                Reply::Silent => continue,
                Reply::Hangup => break,
            };
            if b_write.write_all(format!("{out}\n").as_bytes()).await.is_err() {
                break;
            }
        }
    });

    StdioTransport::new(name, g_read, g_write)
}

/// Handler for a well-behaved backend exporting `tools`.
///
/// `tools/call` answers with `"<backend>:<tool>"` text and echoes the arguments.
pub(crate) fn tool_backend(
    name: &str,
    tools: &[&str],
) -> impl Fn(&str, &serde_json::Value) -> Reply + Send + Sync + 'static {
    let name = name.to_string();
    let tools: Vec<String> = tools.iter().map(|t| t.to_string()).collect();

    move |method, params| match method {
        "initialize" => Reply::Result(serde_json::json!({
            "protocolVersion": super::types::PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": name, "version": "test"}
        })),
        "tools/list" => Reply::Result(serde_json::json!({
            "tools": tools.iter().map(|t| serde_json::json!({
                "name": t,
                "description": format!("{t} from {name}"),
                "inputSchema": {"type": "object"}
            })).collect::<Vec<_>>()
        })),
        "tools/call" => {
            let tool = params["name"].as_str().unwrap_or_default();
            if tools.iter().any(|t| t == tool) {
                Reply::Result(serde_json::json!({
                    "content": [{"type": "text", "text": format!("{name}:{tool}")}],
                    "arguments": params["arguments"].clone()
                }))
            } else {
                Reply::Error(-32602, format!("unknown tool: {tool}"))
            }
        }
        "ping" => Reply::Result(serde_json::json!({})),
        _ => Reply::Silent,
    }
}

pub(crate) fn identity() -> ClientIdentity {
    ClientIdentity {
        name: "gateway-test".into(),
        version: "0.0.0".into(),
    }
}

/// A connection with no process behind it, left in `Starting`.
pub(crate) fn fake_connection<F>(name: &str, order: usize, handler: F) -> Arc<BackendConnection>
where
    F: Fn(&str, &serde_json::Value) -> Reply + Send + Sync + 'static,
{
    let descriptor = BackendDescriptor::new(name, "in-memory", &[]);
    let client = ProtocolClient::new(fake_transport(name, handler));
    Arc::new(BackendConnection::from_parts(descriptor, order, client, None))
}

/// A handshaken, `Ready` in-memory connection.
pub(crate) async fn ready_connection<F>(name: &str, order: usize, handler: F) -> Arc<BackendConnection>
where
    F: Fn(&str, &serde_json::Value) -> Reply + Send + Sync + 'static,
{
    let conn = fake_connection(name, order, handler);
    conn.handshake(&identity(), Duration::from_secs(5))
        .await
        .expect("fake handshake");
    conn
}
