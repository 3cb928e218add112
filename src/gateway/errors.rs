//! Gateway error types.

use thiserror::Error;

/// Errors that can occur while supervising backends or routing calls.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A backend process failed to start.
    #[error("failed to spawn backend '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The backend did not answer the initialization handshake in time.
    #[error("backend '{name}' handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout {
        name: String,
        timeout_ms: u64,
    },

    /// The backend answered the handshake with an error, or hung up during it.
    #[error("backend '{name}' rejected handshake: {reason}")]
    HandshakeRejected {
        name: String,
        reason: String,
    },

    /// Malformed message or a protocol violation on an open channel.
    #[error("transport error for backend '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The backend's pipes closed (process exited or pipe broke).
    #[error("channel to backend '{server}' closed: {reason}")]
    ChannelClosed {
        server: String,
        reason: String,
    },

    /// A request got no response before its deadline.
    #[error("'{method}' on backend '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Backend returned a JSON-RPC error response.
    #[error("backend '{server}' returned error [{code}]: {message}")]
    Rejected {
        server: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found in the capability registry.
    #[error("unknown tool: '{name}'")]
    ToolNotFound {
        name: String,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// Every candidate backend for a tool failed.
    #[error("all {attempts} backend(s) failed for tool '{tool}'; last error: {last}")]
    AllBackendsFailed {
        tool: String,
        attempts: usize,
        last: Box<GatewayError>,
    },

    /// Startup finished with no backend ready to serve.
    #[error("no backend became ready ({configured} configured)")]
    ZeroReadyBackends {
        configured: usize,
    },

    /// Invocation attempted while the gateway is not serving.
    #[error("gateway is not serving (state: {state})")]
    NotServing {
        state: String,
    },

    /// Lifecycle operation called in the wrong gateway state.
    #[error("cannot {operation} gateway in state {state}")]
    InvalidState {
        operation: String,
        state: String,
    },

    /// Configuration error (missing file, bad syntax, unset variable).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl GatewayError {
    /// Whether this error means the backend's channel is gone for good.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, GatewayError::ChannelClosed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_backends_failed_carries_last_cause() {
        let err = GatewayError::AllBackendsFailed {
            tool: "ping".into(),
            attempts: 2,
            last: Box::new(GatewayError::Timeout {
                server: "b".into(),
                method: "tools/call".into(),
                timeout_ms: 100,
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("all 2 backend(s) failed for tool 'ping'"));
        assert!(msg.contains("timed out after 100ms"));
    }

    #[test]
    fn test_is_channel_closed() {
        let closed = GatewayError::ChannelClosed {
            server: "a".into(),
            reason: "stdout closed".into(),
        };
        let not_found = GatewayError::ToolNotFound { name: "x".into() };
        assert!(closed.is_channel_closed());
        assert!(!not_found.is_channel_closed());
    }
}
