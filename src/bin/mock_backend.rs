//! Mock tool server for exercising the gateway end to end.
//!
//! Speaks line-delimited JSON-RPC on stdin/stdout, like a real backend.
//!
//! # Environment Variables
//!
//! - `MOCK_BACKEND_NAME`: server name reported in the handshake (default: `mock`)
//! - `MOCK_BACKEND_TOOLS`: comma-separated tool names (default: `echo`)
//! - `MOCK_BACKEND_REJECT_HANDSHAKE`: answer `initialize` with an error
//! - `MOCK_BACKEND_SILENT_HANDSHAKE`: never answer `initialize`
//! - `MOCK_BACKEND_CRASH_ON`: exit abruptly when this tool is called
//! - `MOCK_BACKEND_IGNORE_SIGTERM`: keep running after SIGTERM
//! - `MOCK_BACKEND_DELAY_MS`: delay before each `tools/call` response (default: 0)
//!
//! `tools/call` answers with the text `"<name>:<tool>"` and echoes the arguments.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct MockConfig {
    name: String,
    tools: Vec<String>,
    reject_handshake: bool,
    silent_handshake: bool,
    crash_on: Option<String>,
    delay: Duration,
}

impl MockConfig {
    fn from_env() -> Self {
        let flag = |key: &str| {
            std::env::var(key)
                .map(|v| !v.is_empty() && v != "0")
                .unwrap_or(false)
        };
        Self {
            name: std::env::var("MOCK_BACKEND_NAME").unwrap_or_else(|_| "mock".to_string()),
            tools: std::env::var("MOCK_BACKEND_TOOLS")
                .unwrap_or_else(|_| "echo".to_string())
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
            reject_handshake: flag("MOCK_BACKEND_REJECT_HANDSHAKE"),
            silent_handshake: flag("MOCK_BACKEND_SILENT_HANDSHAKE"),
            crash_on: std::env::var("MOCK_BACKEND_CRASH_ON").ok().filter(|t| !t.is_empty()),
            delay: Duration::from_millis(
                std::env::var("MOCK_BACKEND_DELAY_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            ),
        }
    }
}

fn success(id: serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn failure(id: serde_json::Value, code: i32, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// Build the response to one request, or `None` to stay silent.
async fn respond(
    config: &MockConfig,
    id: serde_json::Value,
    method: &str,
    params: &serde_json::Value,
) -> Option<serde_json::Value> {
    match method {
        "initialize" if config.silent_handshake => None,
        "initialize" if config.reject_handshake => {
            Some(failure(id, -32600, "handshake refused by configuration"))
        }
        "initialize" => Some(success(
            id,
            serde_json::json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": config.name, "version": env!("CARGO_PKG_VERSION") }
            }),
        )),
        "tools/list" => Some(success(
            id,
            serde_json::json!({
                "tools": config.tools.iter().map(|t| serde_json::json!({
                    "name": t,
                    "description": format!("{t} served by {}", config.name),
                    "inputSchema": { "type": "object" }
                })).collect::<Vec<_>>()
            }),
        )),
        "tools/call" => {
            let tool = params["name"].as_str().unwrap_or_default();
            if config.crash_on.as_deref() == Some(tool) {
                eprintln!("{}: crashing on '{tool}'", config.name);
                std::process::exit(3);
            }
            if !config.delay.is_zero() {
                tokio::time::sleep(config.delay).await;
            }
            if config.tools.iter().any(|t| t == tool) {
                Some(success(
                    id,
                    serde_json::json!({
                        "content": [{ "type": "text", "text": format!("{}:{tool}", config.name) }],
                        "arguments": params["arguments"].clone()
                    }),
                ))
            } else {
                Some(failure(id, -32602, &format!("unknown tool: {tool}")))
            }
        }
        "ping" => Some(success(id, serde_json::json!({}))),
        other => Some(failure(id, -32601, &format!("method not found: {other}"))),
    }
}

async fn write_line(stdout: &Mutex<Stdout>, message: &serde_json::Value) -> std::io::Result<()> {
    let mut out = stdout.lock().await;
    out.write_all(format!("{message}\n").as_bytes()).await?;
    out.flush().await
}

#[cfg(unix)]
fn ignore_sigterm(name: String) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        while sigterm.recv().await.is_some() {
            eprintln!("{name}: ignoring SIGTERM");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_sigterm(_name: String) -> std::io::Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(MockConfig::from_env());

    if std::env::var("MOCK_BACKEND_IGNORE_SIGTERM").is_ok_and(|v| !v.is_empty() && v != "0") {
        ignore_sigterm(config.name.clone())?;
    }

    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("{} ready with tools {:?}", config.name, config.tools);

    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<serde_json::Value>(&line) else {
            eprintln!("{}: ignoring malformed line", config.name);
            continue;
        };
        let Some(method) = message["method"].as_str().map(String::from) else {
            continue;
        };
        // Notifications need no answer.
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(serde_json::Value::Null);

        let config = Arc::clone(&config);
        let stdout = Arc::clone(&stdout);
        tokio::spawn(async move {
            if let Some(response) = respond(&config, id, &method, &params).await {
                if let Err(e) = write_line(&stdout, &response).await {
                    eprintln!("{}: failed to write response: {e}", config.name);
                }
            }
        });
    }

    eprintln!("{}: stdin closed, exiting", config.name);
    Ok(())
}
