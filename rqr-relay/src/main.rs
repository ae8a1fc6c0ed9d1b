//! reverseqr-relay binary entry point.
//!
//! Usage:
//! ```bash
//! reverseqr-relay --config relay.toml
//! PORT=8080 BASE_URL=https://share.example.org reverseqr-relay
//! reverseqr-relay --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use reverseqr_relay::{serve, Config, Relay};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Pairing and signaling relay for ReverseQR transfers.
#[derive(Parser, Debug)]
#[command(name = "reverseqr-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist
    #[arg(long, short, default_value = "relay.toml")]
    config: PathBuf,

    /// Listen port, overriding the configured bind address port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Public base URL used in join links
    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        tracing::info!(
            "No config file at {}, using defaults",
            cli.config.display()
        );
        Config::default()
    };
    if let Some(port) = cli.port {
        config.set_port(port);
    }
    if let Some(base_url) = cli.base_url {
        config.server.base_url = base_url;
    }

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    let relay = Arc::new(Relay::new(config).context("Failed to initialize relay")?);

    serve(relay, listener, shutdown_signal()).await?;
    Ok(())
}

/// Resolve on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
}
