//! Router: dispatches a tool call to its owner and falls back on failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::connection::BackendConnection;
use super::errors::GatewayError;
use super::registry::CapabilityRegistry;
use super::types::InvocationResult;

/// Routes invocations through a shared, immutable registry.
///
/// Cheap to clone; every clone sees the same registry and connections.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<CapabilityRegistry>,
    default_timeout: Duration,
}

impl Router {
    pub fn new(registry: Arc<CapabilityRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Route with the configured call timeout.
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<InvocationResult, GatewayError> {
        self.route(tool_name, arguments, self.default_timeout).await
    }

    /// Invoke `tool_name` on its preferred backend, falling back in order.
    ///
    /// `timeout` applies to each attempt. A backend whose channel closes
    /// mid-call is marked terminated so later resolves skip it. Rejections
    /// and timeouts only move on to the next candidate.
    pub async fn route(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<InvocationResult, GatewayError> {
        self.registry.validate_tool_call(tool_name, &arguments)?;
        let candidates = self.registry.resolve(tool_name)?;

        let start = Instant::now();
        let mut attempts = 0usize;
        let mut last_error: Option<GatewayError> = None;

        for conn in candidates {
            // A previous attempt in this call (or a concurrent one) may have
            // taken the backend out of rotation.
            if !conn.is_ready() {
                continue;
            }
            attempts += 1;

            match conn.client().invoke(tool_name, arguments.clone(), timeout).await {
                Ok(result) => {
                    let execution_time_ms = start.elapsed().as_millis() as u64;
                    tracing::debug!(
                        tool = %tool_name,
                        backend = %conn.name(),
                        attempts,
                        execution_time_ms,
                        "tool call served"
                    );
                    return Ok(InvocationResult {
                        tool_name: tool_name.to_string(),
                        backend: conn.name().to_string(),
                        result,
                        execution_time_ms,
                    });
                }
                Err(e) => {
                    self.note_failure(&conn, tool_name, &e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last) => {
                tracing::error!(tool = %tool_name, attempts, error = %last, "all backends failed");
                Err(GatewayError::AllBackendsFailed {
                    tool: tool_name.to_string(),
                    attempts,
                    last: Box::new(last),
                })
            }
            None => Err(GatewayError::ToolNotFound {
                name: tool_name.to_string(),
            }),
        }
    }

    fn note_failure(&self, conn: &BackendConnection, tool_name: &str, err: &GatewayError) {
        if err.is_channel_closed() {
            if conn.mark_terminated() {
                tracing::warn!(
                    backend = %conn.name(),
                    tool = %tool_name,
                    error = %err,
                    "backend channel closed; excluding from routing"
                );
            }
        } else {
            tracing::warn!(
                backend = %conn.name(),
                tool = %tool_name,
                error = %err,
                "tool call failed; trying next backend"
            );
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection::ConnectionState;
    use crate::gateway::testing::{ready_connection, tool_backend, Reply};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LONG: Duration = Duration::from_secs(5);

    /// The registry only holds weak owners, so the caller keeps the
    /// returned connections alive for as long as it routes.
    async fn router_for(
        connections: Vec<Arc<BackendConnection>>,
    ) -> (Router, Vec<Arc<BackendConnection>>) {
        let registry = CapabilityRegistry::build(&connections, LONG).await;
        (Router::new(Arc::new(registry), LONG), connections)
    }

    /// Backend exporting `tools` whose `tools/call` answers with `reply()`.
    fn failing_backend<F>(
        name: &'static str,
        tools: &'static [&'static str],
        reply: F,
    ) -> impl Fn(&str, &serde_json::Value) -> Reply + Send + Sync + 'static
    where
        F: Fn() -> Reply + Send + Sync + 'static,
    {
        let base = tool_backend(name, tools);
        move |method, params| match method {
            "tools/call" => reply(),
            _ => base(method, params),
        }
    }

    #[tokio::test]
    async fn test_unique_tools_reach_owner() {
        let a = ready_connection("a", 0, tool_backend("a", &["echo"])).await;
        let b = ready_connection("b", 1, tool_backend("b", &["search"])).await;
        let (router, _backends) = router_for(vec![a, b]).await;

        let echo = router.call("echo", serde_json::json!({"text": "hi"})).await.unwrap();
        assert_eq!(echo.backend, "a");
        assert_eq!(echo.result["content"][0]["text"], "a:echo");
        assert_eq!(echo.result["arguments"]["text"], "hi");

        let search = router.call("search", serde_json::json!({})).await.unwrap();
        assert_eq!(search.backend, "b");
    }

    #[tokio::test]
    async fn test_shared_tool_always_first_owner() {
        let a = ready_connection("a", 0, tool_backend("a", &["ping"])).await;
        let b = ready_connection("b", 1, tool_backend("b", &["ping"])).await;
        let (router, _backends) = router_for(vec![a, b]).await;

        for _ in 0..5 {
            let res = router.call("ping", serde_json::json!({})).await.unwrap();
            assert_eq!(res.backend, "a");
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_fast() {
        let a = ready_connection("a", 0, tool_backend("a", &["echo"])).await;
        let (router, _backends) = router_for(vec![a]).await;

        let started = Instant::now();
        let err = router.call("missing", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_rejection_falls_back() {
        let a = ready_connection(
            "a",
            0,
            failing_backend("a", &["ping"], || Reply::Error(-32000, "busy".into())),
        )
        .await;
        let b = ready_connection("b", 1, tool_backend("b", &["ping"])).await;
        let (router, _backends) = router_for(vec![Arc::clone(&a), b]).await;

        let res = router.call("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(res.backend, "b");
        // A rejection does not exclude the backend.
        assert!(a.is_ready());
    }

    #[tokio::test]
    async fn test_timeout_falls_back() {
        let a = ready_connection("a", 0, failing_backend("a", &["ping"], || Reply::Silent)).await;
        let b = ready_connection("b", 1, tool_backend("b", &["ping"])).await;
        let (router, _backends) = router_for(vec![a, b]).await;

        let res = router
            .route("ping", serde_json::json!({}), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(res.backend, "b");
    }

    #[tokio::test]
    async fn test_channel_close_excludes_backend() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let a = ready_connection(
            "a",
            0,
            failing_backend("a", &["ping", "echo"], move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Reply::Hangup
            }),
        )
        .await;
        let b = ready_connection("b", 1, tool_backend("b", &["ping", "search"])).await;
        let (router, _backends) = router_for(vec![Arc::clone(&a), b]).await;

        let res = router.call("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(res.backend, "b");
        assert_eq!(a.state(), ConnectionState::Terminated);

        // Later calls never touch the dead backend.
        let res = router.call("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(res.backend, "b");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Its unique tools are gone; other backends still serve theirs.
        assert!(matches!(
            router.call("echo", serde_json::json!({})).await,
            Err(GatewayError::ToolNotFound { .. })
        ));
        assert!(router.call("search", serde_json::json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_all_backends_failed() {
        let a = ready_connection(
            "a",
            0,
            failing_backend("a", &["ping"], || Reply::Error(-32000, "a down".into())),
        )
        .await;
        let b = ready_connection(
            "b",
            1,
            failing_backend("b", &["ping"], || Reply::Error(-32001, "b down".into())),
        )
        .await;
        let (router, _backends) = router_for(vec![a, b]).await;

        let err = router.call("ping", serde_json::json!({})).await.unwrap_err();
        match err {
            GatewayError::AllBackendsFailed { tool, attempts, last } => {
                assert_eq!(tool, "ping");
                assert_eq!(attempts, 2);
                assert!(matches!(*last, GatewayError::Rejected { code: -32001, .. }));
            }
            other => panic!("expected AllBackendsFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_required_argument() {
        let a = ready_connection("a", 0, |method, _| match method {
            "initialize" => Reply::Result(serde_json::json!({})),
            "tools/list" => Reply::Result(serde_json::json!({
                "tools": [{
                    "name": "reverse",
                    "inputSchema": {"type": "object", "required": ["text"]}
                }]
            })),
            "tools/call" => Reply::Result(serde_json::json!({})),
            _ => Reply::Silent,
        })
        .await;
        let (router, _backends) = router_for(vec![a]).await;

        let err = router.call("reverse", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArguments { .. }));
        assert!(router
            .call("reverse", serde_json::json!({"text": "abc"}))
            .await
            .is_ok());
    }
}
