//! Gateway HTTP server (health check) and process lifecycle.

use crate::config::Config;
use crate::gateway::runtime::Runtime;
use crate::init;
use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Routes served by the gateway.
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new().route("/", get(health_http)).with_state(runtime)
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
///
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let stop = CancellationToken::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_stop.cancel();
    });
    run_gateway_until(config, config_path, stop).await
}

/// Like `run_gateway`, but stops when `stop` is cancelled instead of on a signal.
pub async fn run_gateway_until(config: Config, config_path: PathBuf, stop: CancellationToken) -> Result<()> {
    init::require_initialized(&config_path, &config)?;
    let bind = config.gateway.bind.trim().to_string();
    if !is_loopback_bind(&bind) {
        log::warn!("gateway bound to non-loopback address {}; the health endpoint is public", bind);
    }
    let port = config.gateway.port;

    let runtime = Arc::new(Runtime::assemble(config, &config_path).await?);
    let running = runtime.start().await?;

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    let server_stop = stop.clone();
    let served = axum::serve(listener, router(runtime.clone()))
        .with_graceful_shutdown(async move { server_stop.cancelled().await })
        .await
        .context("gateway server exited");

    log::info!("shutting down: stopping channels and background tasks");
    running.stop(&runtime).await;
    log::info!("gateway stopped");
    served
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

/// GET / returns a simple health JSON.
async fn health_http(State(runtime): State<Arc<Runtime>>) -> Json<serde_json::Value> {
    let cron_jobs = match runtime.cron.store().len().await {
        Ok(n) => n,
        Err(e) => {
            log::warn!("health: reading cron store: {}", e);
            0
        }
    };
    Json(json!({
        "runtime": "running",
        "port": runtime.config.gateway.port,
        "tools": runtime.registry.names().await,
        "cronJobs": cron_jobs,
        "sessions": runtime.sessions.len().await,
        "subagents": runtime.spawner.running(),
    }))
}
