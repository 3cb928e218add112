//! Protocol client: handshake, tool listing and invocation over a transport.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

use super::errors::GatewayError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    ClientIdentity, InitializeResult, ListToolsResult, ToolDescriptor, PROTOCOL_VERSION,
};

/// Upper bound on `tools/list` pages, in case a backend loops its cursor.
const MAX_LIST_PAGES: usize = 64;

/// Speaks the tool protocol to one backend.
pub struct ProtocolClient {
    transport: StdioTransport,
}

impl ProtocolClient {
    pub fn new(transport: StdioTransport) -> Self {
        Self { transport }
    }

    /// Name of the backend on the other end.
    pub fn backend(&self) -> &str {
        self.transport.server_name()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Perform the `initialize` exchange, then send `notifications/initialized`.
    ///
    /// Any failure inside the deadline is reported as `HandshakeRejected`;
    /// running out of time is `HandshakeTimeout`.
    pub async fn handshake(
        &self,
        identity: &ClientIdentity,
        timeout: Duration,
    ) -> Result<InitializeResult, GatewayError> {
        let deadline = Instant::now() + timeout;
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": identity,
        });

        let response = self
            .transport
            .request("initialize", Some(params), timeout)
            .await
            .map_err(|e| self.handshake_error(e, timeout))?;

        let result = extract_result(self.backend(), response)
            .map_err(|e| self.handshake_error(e, timeout))?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| GatewayError::HandshakeRejected {
                name: self.backend().to_string(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.transport
            .notify("notifications/initialized", None, remaining)
            .await
            .map_err(|e| self.handshake_error(e, timeout))?;

        tracing::debug!(
            backend = %self.backend(),
            protocol_version = ?init.protocol_version,
            server = ?init.server_info.as_ref().and_then(|s| s.name.as_deref()),
            "handshake complete"
        );
        Ok(init)
    }

    /// Fetch the backend's full tool catalog, following pagination cursors.
    ///
    /// `timeout` bounds the whole listing, not each page.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let deadline = Instant::now() + timeout;
        let mut tools = Vec::new();
        let mut seen_cursors = HashSet::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::Timeout {
                    server: self.backend().to_string(),
                    method: "tools/list".into(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let response = self.transport.request("tools/list", params, remaining).await?;
            let result = extract_result(self.backend(), response)?;
            let page: ListToolsResult =
                serde_json::from_value(result).map_err(|e| GatewayError::TransportError {
                    server: self.backend().to_string(),
                    reason: format!("failed to parse tools/list response: {e}"),
                })?;

            tools.extend(page.tools);

            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) if seen_cursors.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    return Err(GatewayError::TransportError {
                        server: self.backend().to_string(),
                        reason: format!("tools/list cursor '{next}' repeated"),
                    });
                }
                None => return Ok(tools),
            }
        }

        Err(GatewayError::TransportError {
            server: self.backend().to_string(),
            reason: format!("tools/list exceeded {MAX_LIST_PAGES} pages"),
        })
    }

    /// Call a tool and return the backend's raw result payload.
    pub async fn invoke(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, GatewayError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let response = self
            .transport
            .request("tools/call", Some(params), timeout)
            .await?;
        extract_result(self.backend(), response)
    }

    /// Liveness probe.
    pub async fn ping(&self, timeout: Duration) -> Result<(), GatewayError> {
        let response = self.transport.request("ping", None, timeout).await?;
        extract_result(self.backend(), response).map(|_| ())
    }

    fn handshake_error(&self, err: GatewayError, timeout: Duration) -> GatewayError {
        let name = self.backend().to_string();
        match err {
            GatewayError::Timeout { .. } => GatewayError::HandshakeTimeout {
                name,
                timeout_ms: timeout.as_millis() as u64,
            },
            GatewayError::Rejected { code, message, .. } => GatewayError::HandshakeRejected {
                name,
                reason: format!("[{code}] {message}"),
            },
            GatewayError::ChannelClosed { reason, .. } => GatewayError::HandshakeRejected {
                name,
                reason: format!("channel closed: {reason}"),
            },
            other => GatewayError::HandshakeRejected {
                name,
                reason: other.to_string(),
            },
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
