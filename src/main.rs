//! mcp-gateway binary.
//!
//! Loads the backend configuration, brings every backend up, then serves the
//! merged tool catalog on stdin/stdout until the client closes its input or
//! the process receives SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mcp_gateway::gateway::{load_config, serve, Gateway};
use mcp_gateway::{init_tracing, LogOptions};

/// Stdio tool gateway: one tool catalog over many tool servers.
#[derive(Debug, Parser)]
#[command(name = "mcp-gateway", author, version, about, long_about = None)]
struct Cli {
    /// Backend configuration file (JSON, or YAML by extension)
    #[arg(short, long, env = "MCP_GATEWAY_CONFIG", default_value = "mcp.json")]
    config: PathBuf,

    /// Write logs to this file (rotated on startup) instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// How long to wait for blocking tasks when the runtime shuts down.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(200);

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(LogOptions {
        file: cli.log_file.as_deref(),
        json: cli.log_json,
    }) {
        eprintln!("mcp-gateway: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(&cli));
    // A pending read on stdin sits in a blocking thread and cannot be cancelled.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "gateway exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let max_concurrent = config.max_concurrent_calls;

    let mut gateway = Gateway::new(config);
    let report = gateway.start().await.context("gateway startup failed")?;
    for (backend, reason) in &report.failed {
        tracing::warn!(backend = %backend, reason = %reason, "backend unavailable");
    }

    let served = match gateway.router() {
        Ok(router) => {
            let identity = gateway.config().client_identity();
            serve(
                router,
                identity,
                max_concurrent,
                tokio::io::stdin(),
                tokio::io::stdout(),
                shutdown_signal(),
            )
            .await
            .context("serving client")
        }
        Err(e) => Err(e.into()),
    };

    gateway.shutdown().await;
    served
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received SIGINT, initiating graceful shutdown"),
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("received SIGTERM, initiating graceful shutdown");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
