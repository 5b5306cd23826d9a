// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! `mcp-fleetd` — the MCP fleet runtime daemon entry point.
//!
//! Parses CLI flags, initializes tracing and (optionally) the Prometheus
//! metrics recorder, wires every application service, and serves the HTTP
//! boundary with graceful shutdown, mirroring the teacher's
//! `cli::daemon::server::start_daemon` + `shutdown_signal` shape.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use mcp_fleetd::wiring::{self, Daemon};

/// MCP fleet runtime daemon.
#[derive(Parser)]
#[command(name = "mcp-fleetd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Working directory the config file and instructions file are
    /// resolved relative to (defaults to the current directory).
    #[arg(long, value_name = "DIR")]
    config: Option<PathBuf>,

    /// HTTP bind port.
    #[arg(long, default_value = "8787")]
    port: u16,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity (warnings and errors only).
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    init_metrics();

    let cwd = cli.config.unwrap_or_else(wiring::default_config_dir);
    let admin_token = std::env::var("MCP_ADMIN_TOKEN").ok();
    let test_mode = std::env::var("NODE_ENV").map(|v| v == "test").unwrap_or(false);

    let daemon = Daemon::bootstrap(&cwd, admin_token, test_mode)
        .await
        .context("failed to wire fleet services")?;
    let app = daemon.router();

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "mcp-fleetd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("mcp-fleetd shutting down");
    daemon.shutdown().await;
    Ok(())
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn telemetry_enabled() -> bool {
    for var in ["MCP_ENABLE_TELEMETRY", "PUBLIC_ENABLE_TELEMETRY"] {
        if std::env::var(var).map(|v| v == "1").unwrap_or(false) {
            return true;
        }
    }
    false
}

fn init_metrics() {
    if !telemetry_enabled() {
        return;
    }
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        tracing::warn!(error = %e, "failed to install prometheus recorder");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
