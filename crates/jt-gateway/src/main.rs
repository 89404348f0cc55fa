//! jtunnel gateway daemon
//!
//! Starts a kernel on a Jupyter server and tunnels local TCP and HTTP
//! traffic through it to a destination only the kernel can reach.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jt_core::config::{self, GatewayConfig};
use jt_gateway::{GatewayState, JupyterChannelFactory, ShutdownCoordinator};

#[derive(Parser)]
#[command(name = "jt-gateway")]
#[command(about = "jtunnel gateway daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Jupyter server URL
    #[arg(long, env = "JUPYTER_PROXY_URL")]
    proxy_url: Option<String>,

    /// Local port for raw TCP tunneling
    #[arg(long, env = "LOCAL_PORT")]
    local_port: Option<u16>,

    /// Local port for HTTP forwarding
    #[arg(long, env = "PORT")]
    http_port: Option<u16>,

    /// Destination host as seen from the executor
    #[arg(long, env = "REMOTE_HOST")]
    remote_host: Option<String>,

    /// Destination port as seen from the executor
    #[arg(long, env = "REMOTE_PORT")]
    remote_port: Option<u16>,

    /// Base URL prefixed to forwarded HTTP paths by the executor
    #[arg(long, env = "REMOTE_HTTP_SERVER")]
    remote_url: Option<String>,

    /// Executor-side source sent after the channel opens
    #[arg(long)]
    bootstrap: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("jtunnel gateway starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                GatewayConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            GatewayConfig::default()
        }
    };

    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    // Bind listeners before starting a kernel
    let stream_listener = match &config.gateway.stream_bind {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind stream listener to {}", addr))?,
        ),
        None => None,
    };
    let http_listener = match &config.gateway.http_bind {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind HTTP listener to {}", addr))?,
        ),
        None => None,
    };

    let factory = Arc::new(
        JupyterChannelFactory::new(&config.executor).context("Invalid executor configuration")?,
    );
    let state = GatewayState::start(config, factory.as_ref())
        .await
        .context("Failed to open executor channel")?;

    if let Some(listener) = stream_listener {
        state.serve_streams(listener);
    }
    if let Some(listener) = http_listener {
        state.serve_http(listener);
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    tracing::info!("Gateway ready ({})", state.snapshot());
    cancel.cancelled().await;

    let report = ShutdownCoordinator::new(Arc::clone(&state), factory)
        .run()
        .await;
    if report.timed_out {
        tracing::warn!("Gateway stopped after shutdown grace period expired");
    }

    tracing::info!("Gateway shutdown complete");
    Ok(())
}

/// Apply command-line and environment overrides on top of the file config
fn apply_overrides(config: &mut GatewayConfig, args: &Args) {
    if let Some(port) = args.local_port {
        config.gateway.stream_bind = Some(format!("127.0.0.1:{}", port));
    }
    if let Some(port) = args.http_port {
        config.gateway.http_bind = Some(format!("127.0.0.1:{}", port));
    }
    if let Some(url) = &args.proxy_url {
        config.executor.proxy_url = Some(url.clone());
    }
    if let Some(host) = &args.remote_host {
        config.remote.host = Some(host.clone());
    }
    if let Some(port) = args.remote_port {
        config.remote.port = Some(port);
    }
    if let Some(url) = &args.remote_url {
        config.remote.base_url = Some(url.clone());
    }
    if let Some(path) = &args.bootstrap {
        config.executor.bootstrap = Some(path.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file_values() {
        let args = Args::try_parse_from([
            "jt-gateway",
            "--local-port",
            "9000",
            "--remote-host",
            "10.0.0.5",
            "--remote-port",
            "5432",
            "--proxy-url",
            "http://127.0.0.1:8888",
        ])
        .unwrap();

        let mut config = GatewayConfig::default();
        config.remote.host = Some("from-file".into());
        apply_overrides(&mut config, &args);

        assert_eq!(config.gateway.stream_bind.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(config.remote.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.remote.port, Some(5432));
        assert_eq!(
            config.executor.proxy_url.as_deref(),
            Some("http://127.0.0.1:8888")
        );
    }

    #[test]
    fn test_log_level_default() {
        let args = Args::try_parse_from(["jt-gateway"]).unwrap();
        assert_eq!(args.log_level, "info");
        assert!(!args.foreground);
    }
}
