//! Pylon notify service - CLI application
//!
//! Relays deployment events posted by pipelines to connected WebSocket
//! clients. Nothing is persisted.

use clap::Parser;
use pylon::notify::{router, Relay};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Pylon Notify - deployment event relay
#[derive(Parser)]
#[command(name = "pylon-notify")]
#[command(version, about = "Deployment event relay over WebSocket", long_about = None)]
struct Cli {
    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port
    #[arg(short, long, default_value_t = 3003)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let relay = Arc::new(Relay::new());
    let app = router(relay).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;
    info!("Starting notify relay on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
