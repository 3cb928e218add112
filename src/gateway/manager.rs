//! Lifecycle manager: startup, serving state and graceful shutdown.
//!
//! Startup runs `spawn all → handshake all → build registry → serve`.
//! A backend that fails to spawn, handshake or list its tools is excluded on
//! its own; startup only fails when no backend at all is left ready.
//!
//! Shutdown probes every ready backend, then terminates and reaps every
//! process concurrently, escalating to kill after the grace period.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;

use super::config::{BackendDescriptor, GatewayConfig};
use super::connection::{BackendConnection, ConnectionState};
use super::errors::GatewayError;
use super::registry::CapabilityRegistry;
use super::router::Router;
use super::types::{InvocationResult, ToolDescriptor};

// ─── GatewayState ────────────────────────────────────────────────────────────

/// `Idle → Spawning → HandshakingAll → Serving → ShuttingDown → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Idle,
    Spawning,
    HandshakingAll,
    Serving,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GatewayState::Idle => "idle",
            GatewayState::Spawning => "spawning",
            GatewayState::HandshakingAll => "handshaking",
            GatewayState::Serving => "serving",
            GatewayState::ShuttingDown => "shutting_down",
            GatewayState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ─── Reports ─────────────────────────────────────────────────────────────────

/// Outcome of a successful `start()`.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    /// Ready backends, in discovery order.
    pub ready: Vec<String>,
    /// `(backend, reason)` for every excluded backend.
    pub failed: Vec<(String, String)>,
    /// Size of the merged catalog.
    pub tool_count: usize,
}

/// Point-in-time view of one configured backend.
#[derive(Debug, Clone)]
pub struct BackendStatus {
    pub name: String,
    pub state: ConnectionState,
    pub pid: Option<u32>,
    /// Name reported by the backend in its handshake.
    pub server_name: Option<String>,
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

/// Owns every backend connection, the registry and the router.
pub struct Gateway {
    config: GatewayConfig,
    state: GatewayState,
    /// Spawned backends, in discovery order.
    connections: Vec<Arc<BackendConnection>>,
    /// Backends that never got a process, kept for diagnostics.
    spawn_failures: Vec<(BackendDescriptor, String)>,
    router: Option<Router>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            state: GatewayState::Idle,
            connections: Vec::new(),
            spawn_failures: Vec::new(),
            router: None,
        }
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn connections(&self) -> &[Arc<BackendConnection>] {
        &self.connections
    }

    /// Bring every configured backend up and start serving.
    ///
    /// Fails with `ZeroReadyBackends` (leaving the gateway `Stopped` with all
    /// processes reaped) when no backend survives startup.
    pub async fn start(&mut self) -> Result<StartupReport, GatewayError> {
        if self.state != GatewayState::Idle {
            return Err(GatewayError::InvalidState {
                operation: "start".into(),
                state: self.state.to_string(),
            });
        }

        // ── Spawn ──
        self.state = GatewayState::Spawning;
        let configured = self.config.backends.len();
        tracing::info!(backends = configured, "spawning backends");

        for (order, descriptor) in self.config.backends.iter().enumerate() {
            match BackendConnection::spawn(descriptor.clone(), order) {
                Ok(conn) => self.connections.push(Arc::new(conn)),
                Err(e) => {
                    tracing::warn!(backend = %descriptor.name, error = %e, "backend excluded");
                    self.spawn_failures.push((descriptor.clone(), e.to_string()));
                }
            }
        }

        // ── Handshake ──
        self.state = GatewayState::HandshakingAll;
        let identity = self.config.client_identity();
        let handshake_timeout = self.config.handshake_timeout();
        join_all(
            self.connections
                .iter()
                .map(|conn| conn.handshake(&identity, handshake_timeout)),
        )
        .await;
        self.stop_failed().await;

        // ── Discover ──
        let registry = CapabilityRegistry::build(&self.connections, handshake_timeout).await;
        self.stop_failed().await;

        let report = self.startup_report(registry.len());
        if report.ready.is_empty() {
            tracing::error!(configured, "no backend became ready");
            self.shutdown().await;
            return Err(GatewayError::ZeroReadyBackends { configured });
        }

        self.router = Some(Router::new(Arc::new(registry), self.config.call_timeout()));
        self.state = GatewayState::Serving;
        tracing::info!(
            ready = report.ready.len(),
            failed = report.failed.len(),
            tools = report.tool_count,
            "gateway serving"
        );
        Ok(report)
    }

    /// Router handle for serving calls. Only available while `Serving`.
    pub fn router(&self) -> Result<Router, GatewayError> {
        match (&self.router, self.state) {
            (Some(router), GatewayState::Serving) => Ok(router.clone()),
            _ => Err(GatewayError::NotServing {
                state: self.state.to_string(),
            }),
        }
    }

    /// Route one tool call with the configured call timeout.
    pub async fn invoke(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<InvocationResult, GatewayError> {
        self.router()?.call(tool_name, arguments).await
    }

    /// Merged catalog of tools that currently have a ready backend.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.router
            .as_ref()
            .map(|r| r.registry().available_tools())
            .unwrap_or_default()
    }

    /// Status of every configured backend, in configuration order.
    pub async fn backend_statuses(&self) -> Vec<BackendStatus> {
        let mut statuses = Vec::with_capacity(self.config.backends.len());
        for conn in &self.connections {
            statuses.push(BackendStatus {
                name: conn.name().to_string(),
                state: conn.state(),
                pid: conn.pid().await,
                server_name: conn.server_info().and_then(|s| s.name),
            });
        }
        for (descriptor, reason) in &self.spawn_failures {
            statuses.push(BackendStatus {
                name: descriptor.name.clone(),
                state: ConnectionState::Failed {
                    reason: reason.clone(),
                },
                pid: None,
                server_name: None,
            });
        }

        let order = |name: &str| self.config.backends.iter().position(|b| b.name == name);
        statuses.sort_by_key(|s| order(&s.name));
        statuses
    }

    /// Probe, terminate and reap every backend. Calling it again is a no-op.
    pub async fn shutdown(&mut self) {
        if self.state == GatewayState::Stopped {
            return;
        }
        self.state = GatewayState::ShuttingDown;
        tracing::info!(backends = self.connections.len(), "shutting down gateway");

        let ping_timeout = self.config.ping_timeout();
        let grace = self.config.shutdown_grace();
        let statuses = join_all(
            self.connections
                .iter()
                .map(|conn| conn.shutdown(ping_timeout, grace)),
        )
        .await;

        for (conn, status) in self.connections.iter().zip(statuses) {
            tracing::debug!(backend = %conn.name(), exit_status = ?status, "backend stopped");
        }

        self.router = None;
        self.state = GatewayState::Stopped;
        tracing::info!("gateway stopped");
    }

    /// Reap processes of connections that failed during startup.
    async fn stop_failed(&self) {
        let grace = self.config.shutdown_grace();
        join_all(
            self.connections
                .iter()
                .filter(|c| matches!(c.state(), ConnectionState::Failed { .. }))
                .map(|conn| conn.stop_process(grace)),
        )
        .await;
    }

    fn startup_report(&self, tool_count: usize) -> StartupReport {
        let mut report = StartupReport {
            tool_count,
            ..StartupReport::default()
        };
        for conn in &self.connections {
            match conn.state() {
                ConnectionState::Ready => report.ready.push(conn.name().to_string()),
                ConnectionState::Failed { reason } => {
                    report.failed.push((conn.name().to_string(), reason))
                }
                other => report
                    .failed
                    .push((conn.name().to_string(), other.to_string())),
            }
        }
        for (descriptor, reason) in &self.spawn_failures {
            report.failed.push((descriptor.name.clone(), reason.clone()));
        }
        report
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("state", &self.state)
            .field("connections", &self.connections)
            .field("spawn_failures", &self.spawn_failures.len())
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
