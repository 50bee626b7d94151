//! Pylon auth service - CLI application
//!
//! Issues and verifies the JWTs the gateway checks: registration, login with
//! lockout, refresh rotation, profile management, and admin user management.

use clap::Parser;
use pylon::auth_service::store::InMemoryUserStore;
use pylon::auth_service::{router, AuthService};
use pylon::config::AuthServiceConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Pylon Auth - user accounts and JWT issuance
#[derive(Parser)]
#[command(name = "pylon-auth")]
#[command(version, about = "User accounts and JWT issuance", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "auth.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AuthServiceConfig::from_file(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Loaded configuration from {}", cli.config);
    if config.diagnostic_mode {
        info!("Diagnostic mode enabled: internal error detail is exposed in responses");
    }

    let store = Arc::new(InMemoryUserStore::new());
    let service = Arc::new(AuthService::new(&config, store));

    let app = router(service).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server.addr().parse()?;
    info!("Starting auth service on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
