use std::net::SocketAddr;

use clap::Parser;
use palisade::{AppState, build_app, config::{GatewayConfig, LogFormat}};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "palisade", version, about = "Content-moderation gateway")]
struct Cli {
    /// Path to a TOML configuration file. Without it, configuration is
    /// assembled from environment variables.
    #[arg(long, short = 'c')]
    config: Option<std::path::PathBuf>,

    /// Override the configured bind address.
    #[arg(long)]
    host: Option<std::net::IpAddr>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::from_env()?,
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_tracing(&config);

    let addr = SocketAddr::new(config.server.host, config.server.port);
    let state = AppState::new(config).await?;
    let app = build_app(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, version = env!("CARGO_PKG_VERSION"), "palisade listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let in-flight background work finish and flush buffered statistics
    // before the process exits.
    state.shutdown().await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_filter));

    match config.server.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("ctrl-c handler installs");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installs")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
