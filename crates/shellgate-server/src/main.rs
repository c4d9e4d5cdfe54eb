//! shellgate-server: browser terminal bridge.
//!
//! Accepts WebSocket connections carrying a shared-secret token and gives
//! each one an interactive shell on this host, PTY-backed when available.

mod auth;
mod config;
mod screen;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig, SpawnMode, TOKENS_ENV};
use server::ShellgateServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// shellgate-server: browser terminal bridge
#[derive(Parser, Debug)]
#[command(name = "shellgate-server", version, about = "Browser terminal bridge")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.shellgate/config.toml")]
    config: String,

    /// How shells are attached (pty or pipe)
    #[arg(long, value_enum)]
    mode: Option<SpawnMode>,

    /// Shell program (default: $SHELL, then /bin/sh)
    #[arg(long)]
    shell: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Idle timeout in seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting shellgate-server");

    let overrides = ConfigOverrides {
        bind: cli.bind,
        port: cli.port,
        mode: cli.mode,
        shell: cli.shell,
        max_sessions: cli.max_sessions,
        idle_timeout: cli.idle_timeout,
    };
    let env_tokens = std::env::var(TOKENS_ENV).ok();
    let config_path = PathBuf::from(&cli.config);
    let server_config =
        match ServerConfig::load(Some(&config_path), env_tokens.as_deref(), overrides) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = %e, "failed to load config");
                std::process::exit(1);
            }
        };

    let server = match ShellgateServer::new(server_config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    let registry = server.registry().clone();
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                registry.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    registry.shutdown().await;
    info!("shellgate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
