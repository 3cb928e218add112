//! One supervised backend: its process, protocol client and tagged state.

use std::fmt;
use std::process::ExitStatus;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::config::BackendDescriptor;
use super::errors::GatewayError;
use super::protocol::ProtocolClient;
use super::supervisor::{self, ManagedProcess};
use super::transport::StdioTransport;
use super::types::{ClientIdentity, ServerInfo};

// ─── ConnectionState ─────────────────────────────────────────────────────────

/// Where a backend connection is in its lifetime.
///
/// `Starting → Ready → Terminated`, or `Starting → Failed`. `Failed` and
/// `Terminated` are terminal; only `Ready` connections are routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Starting,
    Ready,
    Failed { reason: String },
    Terminated,
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Starting => f.write_str("starting"),
            ConnectionState::Ready => f.write_str("ready"),
            ConnectionState::Failed { reason } => write!(f, "failed: {reason}"),
            ConnectionState::Terminated => f.write_str("terminated"),
        }
    }
}

// ─── BackendConnection ───────────────────────────────────────────────────────

/// A spawned backend with its protocol client.
pub struct BackendConnection {
    descriptor: BackendDescriptor,
    /// Position in discovery (configuration) order.
    order: usize,
    client: ProtocolClient,
    state: Mutex<ConnectionState>,
    server_info: Mutex<Option<ServerInfo>>,
    /// `None` for connections without a child process (tests).
    process: tokio::sync::Mutex<Option<ManagedProcess>>,
}

impl BackendConnection {
    /// Spawn the backend's process and wire a protocol client to its stdio.
    pub fn spawn(descriptor: BackendDescriptor, order: usize) -> Result<Self, GatewayError> {
        let spawned = supervisor::spawn(&descriptor)?;
        let transport = StdioTransport::new(&descriptor.name, spawned.stdout, spawned.stdin);
        Ok(Self::from_parts(
            descriptor,
            order,
            ProtocolClient::new(transport),
            Some(spawned.process),
        ))
    }

    /// Assemble a connection from already-built parts. Starts in `Starting`.
    pub fn from_parts(
        descriptor: BackendDescriptor,
        order: usize,
        client: ProtocolClient,
        process: Option<ManagedProcess>,
    ) -> Self {
        Self {
            descriptor,
            order,
            client,
            state: Mutex::new(ConnectionState::Starting),
            server_info: Mutex::new(None),
            process: tokio::sync::Mutex::new(process),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    /// Current state. A `Ready` backend whose channel has closed since the
    /// last look (it exited while idle) is moved to `Terminated` here.
    pub fn state(&self) -> ConnectionState {
        self.observed_state().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.observed_state().is_ready()
    }

    /// Server name/version reported during the handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run the handshake; `Starting → Ready` on success, `→ Failed` otherwise.
    pub async fn handshake(
        &self,
        identity: &ClientIdentity,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        match self.client.handshake(identity, timeout).await {
            Ok(init) => {
                *self.server_info.lock().unwrap_or_else(PoisonError::into_inner) =
                    init.server_info;
                let mut state = self.lock_state();
                if *state == ConnectionState::Starting {
                    *state = ConnectionState::Ready;
                }
                tracing::info!(backend = %self.name(), "backend ready");
                Ok(())
            }
            Err(e) => {
                self.mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Exclude this backend after a startup failure.
    ///
    /// No effect once the connection has already failed or terminated.
    pub fn mark_failed(&self, reason: String) {
        let mut state = self.lock_state();
        if matches!(*state, ConnectionState::Starting | ConnectionState::Ready) {
            tracing::warn!(backend = %self.name(), reason = %reason, "backend failed");
            *state = ConnectionState::Failed { reason };
        }
    }

    /// `Ready → Terminated`. Returns whether this call made the transition.
    pub fn mark_terminated(&self) -> bool {
        let mut state = self.lock_state();
        if state.is_ready() {
            *state = ConnectionState::Terminated;
            true
        } else {
            false
        }
    }

    /// OS process id of the backend, if it has one and it hasn't been reaped.
    pub async fn pid(&self) -> Option<u32> {
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(p) => {
                if p.is_alive() {
                    p.id()
                } else {
                    None
                }
            }
            None => None,
        }
    }

    /// Whether the backend's child process is still running.
    pub async fn has_live_process(&self) -> bool {
        let mut process = self.process.lock().await;
        process.as_mut().is_some_and(|p| p.is_alive())
    }

    /// Terminate and reap the child process, escalating to kill after `grace`.
    pub async fn stop_process(&self, grace: Duration) -> Option<ExitStatus> {
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(p) => p.shutdown(grace).await,
            None => None,
        }
    }

    /// Graceful shutdown: best-effort ping, mark terminated, stop the process.
    pub async fn shutdown(&self, ping_timeout: Duration, grace: Duration) -> Option<ExitStatus> {
        if self.is_ready() {
            if let Err(e) = self.client.ping(ping_timeout).await {
                tracing::warn!(backend = %self.name(), error = %e, "liveness probe failed during shutdown");
            }
        }
        self.mark_terminated();
        self.stop_process(grace).await
    }

    fn observed_state(&self) -> MutexGuard<'_, ConnectionState> {
        let mut state = self.lock_state();
        if state.is_ready() && self.client.is_closed() {
            tracing::warn!(backend = %self.name(), "backend channel closed while idle; excluding from routing");
            *state = ConnectionState::Terminated;
        }
        state
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("name", &self.descriptor.name)
            .field("order", &self.order)
            .field("state", &self.state())
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{fake_connection, identity, tool_backend, Reply};

    #[tokio::test]
    async fn test_handshake_makes_ready() {
        let conn = fake_connection("a", 0, tool_backend("a", &["echo"]));
        assert_eq!(conn.state(), ConnectionState::Starting);

        conn.handshake(&identity(), Duration::from_secs(5)).await.unwrap();
        assert!(conn.is_ready());
        assert_eq!(conn.server_info().unwrap().name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_failed_handshake_marks_failed() {
        let conn = fake_connection("a", 0, |_, _| Reply::Error(-32600, "no".into()));
        let err = conn
            .handshake(&identity(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::HandshakeRejected { .. }));
        match conn.state() {
            ConnectionState::Failed { reason } => assert!(reason.contains("rejected handshake")),
            other => panic!("expected Failed, got {other:?}"),
        }
        // Failed is terminal.
        assert!(!conn.mark_terminated());
    }

    #[tokio::test]
    async fn test_mark_terminated_only_once() {
        let conn = fake_connection("a", 0, tool_backend("a", &[]));
        conn.handshake(&identity(), Duration::from_secs(5)).await.unwrap();
        assert!(conn.mark_terminated());
        assert!(!conn.mark_terminated());
        assert_eq!(conn.state(), ConnectionState::Terminated);
    }

    #[tokio::test]
    async fn test_idle_hangup_becomes_terminated() {
        let conn = fake_connection("a", 0, |method, params| match method {
            "ping" => Reply::Hangup,
            _ => tool_backend("a", &["echo"])(method, params),
        });
        conn.handshake(&identity(), Duration::from_secs(5)).await.unwrap();
        assert!(conn.is_ready());

        let err = conn.client().ping(Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_channel_closed());

        // Nothing routed a call to it, yet it is no longer offered.
        assert!(!conn.is_ready());
        assert_eq!(conn.state(), ConnectionState::Terminated);
        assert!(!conn.mark_terminated());
    }

    #[tokio::test]
    async fn test_shutdown_without_process() {
        let conn = fake_connection("a", 0, tool_backend("a", &[]));
        conn.handshake(&identity(), Duration::from_secs(5)).await.unwrap();
        let status = conn
            .shutdown(Duration::from_millis(100), Duration::from_millis(100))
            .await;
        assert!(status.is_none());
        assert_eq!(conn.state(), ConnectionState::Terminated);
        assert!(!conn.has_live_process().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pid_cleared_once_reaped() {
        let descriptor = BackendDescriptor::new("sleepy", "sh", &["-c", "sleep 30"]);
        let conn = BackendConnection::spawn(descriptor, 0).unwrap();
        assert!(conn.pid().await.is_some());
        assert!(conn.has_live_process().await);

        conn.stop_process(Duration::from_secs(5)).await.unwrap();
        assert_eq!(conn.pid().await, None);
        assert!(!conn.has_live_process().await);

        let no_process = fake_connection("a", 0, tool_backend("a", &[]));
        assert_eq!(no_process.pid().await, None);
    }

    #[test]
    fn test_state_display() {
        let failed = ConnectionState::Failed {
            reason: "boom".into(),
        };
        assert_eq!(failed.to_string(), "failed: boom");
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
    }
}
