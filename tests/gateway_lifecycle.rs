//! End-to-end gateway tests against real `mock_backend` child processes.

use std::time::{Duration, Instant};

use mcp_gateway::gateway::{
    load_config, BackendDescriptor, ConnectionState, Gateway, GatewayConfig, GatewayError,
    GatewayState,
};

const MOCK: &str = env!("CARGO_BIN_EXE_mock_backend");

fn mock(name: &str, tools: &str, extra: &[(&str, &str)]) -> BackendDescriptor {
    let mut descriptor = BackendDescriptor::new(name, MOCK, &[]);
    descriptor
        .env
        .insert("MOCK_BACKEND_NAME".into(), name.to_string());
    descriptor
        .env
        .insert("MOCK_BACKEND_TOOLS".into(), tools.to_string());
    for (key, value) in extra {
        descriptor.env.insert(key.to_string(), value.to_string());
    }
    descriptor
}

fn config(backends: Vec<BackendDescriptor>) -> GatewayConfig {
    let mut config = GatewayConfig::with_backends(backends);
    config.handshake_timeout_ms = 5_000;
    config.call_timeout_ms = 5_000;
    config.shutdown_grace_ms = 500;
    config.ping_timeout_ms = 500;
    config
}

async fn started(backends: Vec<BackendDescriptor>) -> Gateway {
    let mut gateway = Gateway::new(config(backends));
    gateway.start().await.expect("gateway starts");
    gateway
}

fn text_of(result: &serde_json::Value) -> &str {
    result["content"][0]["text"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn test_echo_and_search_ownership() {
    let mut gateway = started(vec![
        mock("alpha", "echo", &[]),
        mock("beta", "search", &[]),
    ])
    .await;
    assert_eq!(gateway.state(), GatewayState::Serving);

    let names: Vec<String> = gateway.tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["echo", "search"]);

    let echo = gateway
        .invoke("echo", serde_json::json!({"text": "hello"}))
        .await
        .unwrap();
    assert_eq!(echo.backend, "alpha");
    assert_eq!(text_of(&echo.result), "alpha:echo");
    assert_eq!(echo.result["arguments"]["text"], "hello");

    let search = gateway.invoke("search", serde_json::json!({})).await.unwrap();
    assert_eq!(search.backend, "beta");
    assert_eq!(text_of(&search.result), "beta:search");

    gateway.shutdown().await;
    assert_eq!(gateway.state(), GatewayState::Stopped);
}

#[tokio::test]
async fn test_handshake_rejection_excludes_only_that_backend() {
    let mut gateway = Gateway::new(config(vec![
        mock("alpha", "echo", &[("MOCK_BACKEND_REJECT_HANDSHAKE", "1")]),
        mock("beta", "search", &[]),
    ]));
    let report = gateway.start().await.unwrap();
    assert_eq!(report.ready, vec!["beta"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "alpha");
    assert!(report.failed[0].1.contains("rejected handshake"));

    let search = gateway.invoke("search", serde_json::json!({})).await.unwrap();
    assert_eq!(search.backend, "beta");
    assert!(matches!(
        gateway.invoke("echo", serde_json::json!({})).await,
        Err(GatewayError::ToolNotFound { .. })
    ));

    // The rejected backend was stopped right away.
    let statuses = gateway.backend_statuses().await;
    assert!(matches!(statuses[0].state, ConnectionState::Failed { .. }));
    assert_eq!(statuses[0].pid, None);
    assert!(statuses[1].pid.is_some());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_shared_tool_always_routes_to_first_backend() {
    let mut gateway = started(vec![
        mock("alpha", "ping,echo", &[]),
        mock("beta", "ping,search", &[]),
    ])
    .await;

    for _ in 0..10 {
        let result = gateway.invoke("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(result.backend, "alpha");
    }

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_zero_ready_backends_is_fatal() {
    let mut gateway = Gateway::new(config(vec![
        mock("alpha", "echo", &[("MOCK_BACKEND_REJECT_HANDSHAKE", "1")]),
        mock("beta", "search", &[("MOCK_BACKEND_REJECT_HANDSHAKE", "1")]),
    ]));
    let err = gateway.start().await.unwrap_err();
    assert!(matches!(err, GatewayError::ZeroReadyBackends { configured: 2 }));
    assert_eq!(gateway.state(), GatewayState::Stopped);

    for conn in gateway.connections() {
        assert!(!conn.has_live_process().await);
    }
}

#[tokio::test]
async fn test_spawn_failure_leaves_remaining_backends() {
    let mut gateway = Gateway::new(config(vec![
        BackendDescriptor::new("ghost", "/nonexistent/tool-server", &[]),
        mock("alpha", "echo", &[]),
        mock("beta", "search", &[]),
    ]));
    let report = gateway.start().await.unwrap();
    assert_eq!(report.ready, vec!["alpha", "beta"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "ghost");

    let statuses = gateway.backend_statuses().await;
    let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["ghost", "alpha", "beta"]);
    assert_eq!(statuses[1].server_name.as_deref(), Some("alpha"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_crash_mid_call_falls_back_and_excludes() {
    let mut gateway = started(vec![
        mock("alpha", "ping,echo", &[("MOCK_BACKEND_CRASH_ON", "ping")]),
        mock("beta", "ping,search", &[]),
    ])
    .await;

    let result = gateway.invoke("ping", serde_json::json!({})).await.unwrap();
    assert_eq!(result.backend, "beta");
    assert_eq!(
        gateway.connections()[0].state(),
        ConnectionState::Terminated
    );

    // Excluded for good; the other backend keeps serving its own tools.
    let result = gateway.invoke("ping", serde_json::json!({})).await.unwrap();
    assert_eq!(result.backend, "beta");
    assert!(gateway.invoke("search", serde_json::json!({})).await.is_ok());
    assert!(matches!(
        gateway.invoke("echo", serde_json::json!({})).await,
        Err(GatewayError::ToolNotFound { .. })
    ));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unknown_tool_returns_quickly() {
    let mut gateway = started(vec![mock("alpha", "echo", &[("MOCK_BACKEND_DELAY_MS", "2000")])]).await;

    let started_at = Instant::now();
    let err = gateway
        .invoke("does_not_exist", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ToolNotFound { .. }));
    assert!(started_at.elapsed() < Duration::from_millis(500));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_handshake_timeout_excludes_silent_backend() {
    let mut cfg = config(vec![
        mock("alpha", "echo", &[("MOCK_BACKEND_SILENT_HANDSHAKE", "1")]),
        mock("beta", "search", &[]),
    ]);
    cfg.handshake_timeout_ms = 500;
    let mut gateway = Gateway::new(cfg);

    let report = gateway.start().await.unwrap();
    assert_eq!(report.ready, vec!["beta"]);
    assert!(report.failed[0].1.contains("timed out"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_call_timeout_is_reported() {
    let mut cfg = config(vec![mock("alpha", "slow", &[("MOCK_BACKEND_DELAY_MS", "3000")])]);
    cfg.call_timeout_ms = 200;
    let mut gateway = Gateway::new(cfg);
    gateway.start().await.unwrap();

    let err = gateway.invoke("slow", serde_json::json!({})).await.unwrap_err();
    match err {
        GatewayError::AllBackendsFailed { attempts, last, .. } => {
            assert_eq!(attempts, 1);
            assert!(matches!(*last, GatewayError::Timeout { .. }));
        }
        other => panic!("expected AllBackendsFailed, got {other:?}"),
    }
    // A timeout doesn't exclude the backend.
    assert!(gateway.connections()[0].is_ready());

    gateway.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigterm_ignoring_backend_is_killed_within_grace() {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let mut gateway = started(vec![
        mock("stubborn", "echo", &[("MOCK_BACKEND_IGNORE_SIGTERM", "1")]),
        mock("polite", "search", &[]),
    ])
    .await;

    let mut pids = Vec::new();
    for status in gateway.backend_statuses().await {
        pids.push(status.pid.expect("running backend has a pid"));
    }

    let started_at = Instant::now();
    gateway.shutdown().await;
    let elapsed = started_at.elapsed();

    // Grace (500ms) plus probe and kill/reap slack.
    assert!(elapsed < Duration::from_secs(4), "shutdown took {elapsed:?}");
    assert!(elapsed >= Duration::from_millis(500), "grace was not honored");

    for pid in pids {
        assert!(
            kill(Pid::from_raw(pid as i32), None).is_err(),
            "backend {pid} still exists after shutdown"
        );
    }
    for conn in gateway.connections() {
        assert_eq!(conn.state(), ConnectionState::Terminated);
        assert!(!conn.has_live_process().await);
    }
}

#[tokio::test]
async fn test_config_file_end_to_end() {
    std::env::set_var("MCP_GATEWAY_TEST_BACKEND_NAME", "from-env");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.json");
    let raw = serde_json::json!({
        "shutdownGraceMs": 500,
        "servers": {
            "first": {
                "command": MOCK,
                "env": {
                    "MOCK_BACKEND_NAME": "${MCP_GATEWAY_TEST_BACKEND_NAME}",
                    "MOCK_BACKEND_TOOLS": "reverse"
                }
            }
        }
    });
    std::fs::write(&path, raw.to_string()).unwrap();

    let config = load_config(&path).unwrap();
    let mut gateway = Gateway::new(config);
    gateway.start().await.unwrap();

    let result = gateway
        .invoke("reverse", serde_json::json!({"text": "abc"}))
        .await
        .unwrap();
    assert_eq!(result.backend, "first");
    assert_eq!(text_of(&result.result), "from-env:reverse");

    gateway.shutdown().await;
}
