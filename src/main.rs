//! Pylon gateway - CLI application
//!
//! An API gateway with:
//! - Prefix routing configured via TOML
//! - Per-upstream circuit breaking and retry with backoff
//! - JWT verification for protected routes
//! - On-demand upstream health aggregation
//! - Prometheus metrics

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::{Parser, Subcommand};
use pylon::{
    auth_gate::{inject_identity_headers, AuthGate},
    breaker::BreakerConfig,
    config::GatewayConfig,
    error::ApiError,
    health::{HealthChecker, HealthStatus, UpstreamMonitor},
    metrics::GatewayMetrics,
    proxy::ProxyService,
    rate_limit::RateLimiter,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Pylon - API gateway with circuit breaking and JWT authentication
#[derive(Parser)]
#[command(name = "pylon-gateway")]
#[command(version, about = "API gateway with circuit breaking and JWT authentication", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "gateway.toml")]
        config: String,
    },
    /// Validate the configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "gateway.toml")]
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "gateway.toml")]
        output: String,
    },
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    proxy: Arc<ProxyService>,
    metrics: Arc<GatewayMetrics>,
    health: Arc<HealthChecker>,
    monitor: Arc<UpstreamMonitor>,
    gate: Arc<AuthGate>,
    limiter: Arc<RateLimiter>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_server(&config).await?,
        Commands::Validate { config } => validate_config(&config)?,
        Commands::Init { output } => generate_sample_config(&output)?,
    }

    Ok(())
}

/// Start the gateway server
async fn start_server(config_path: &str) -> anyhow::Result<()> {
    let config = GatewayConfig::from_file(config_path)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Loaded configuration from {}", config_path);

    let metrics = Arc::new(GatewayMetrics::new());
    let health = Arc::new(HealthChecker::new());
    let monitor = Arc::new(UpstreamMonitor::new(&config.routes));
    let gate = Arc::new(AuthGate::new(&config.auth_gate));
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));

    gate.spawn_sweeper();
    if limiter.enabled() {
        limiter.spawn_pruner();
    }

    let proxy_routes = ProxyService::routes_from_config(&config.routes)?;
    let breaker_config = BreakerConfig {
        failure_threshold: config.breaker.failure_threshold,
        reset_timeout: Duration::from_secs(config.breaker.reset_timeout_secs),
    };
    let proxy = Arc::new(ProxyService::new(
        proxy_routes,
        breaker_config,
        metrics.clone(),
    ));

    let state = AppState {
        proxy,
        metrics: metrics.clone(),
        health,
        monitor,
        gate,
        limiter,
    };

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/health/detailed", get(detailed_health_handler))
        .route("/health/service/:name", get(service_health_handler))
        .route(&config.metrics.path, get(metrics_handler))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(cors) = cors_layer(&config.cors.allowed_origins) {
        app = app.layer(cors);
    }

    if config.metrics.enabled {
        info!("Metrics endpoint enabled at {}", config.metrics.path);
    }
    if config.rate_limit.enabled {
        info!(
            "Rate limiting enabled: {} requests per {}s",
            config.rate_limit.max_requests, config.rate_limit.window_secs
        );
    }

    let addr: SocketAddr = config.server.addr().parse()?;
    info!("Starting gateway server on {}", addr);
    info!("Routes configured: {}", config.enabled_routes().len());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Build a CORS layer from the configured origin list. An empty list leaves
/// CORS off; "*" allows any origin.
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }

    let layer = if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<axum::http::HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Some(layer)
}

/// Validate configuration file
fn validate_config(config_path: &str) -> anyhow::Result<()> {
    match GatewayConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid!");
            println!();
            println!("Server: {}:{}", config.server.host, config.server.port);
            println!("Routes: {}", config.routes.len());
            println!();
            println!("Routes:");
            for route in &config.routes {
                let status = if route.enabled { "✓" } else { "✗" };
                let auth = if route.auth_required { " [auth]" } else { "" };
                println!("  {} {} → {}{}", status, route.path, route.target, auth);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration is invalid:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

/// Generate sample configuration file
fn generate_sample_config(output_path: &str) -> anyhow::Result<()> {
    let sample_config = r#"# Pylon Gateway Configuration

[server]
host = "0.0.0.0"
port = 8080

log_level = "info"

[metrics]
enabled = true
path = "/metrics"

[cors]
# Empty list disables CORS; "*" allows any origin
allowed_origins = []

[rate_limit]
enabled = false
window_secs = 60
max_requests = 100

[breaker]
failure_threshold = 5
reset_timeout_secs = 30

[auth_gate]
# Shared HS256 secret; PYLON_JWT_SECRET overrides this
jwt_secret = ""
cache_ttl_secs = 300
# Optional: auth service introspection endpoint
# introspect_url = "http://localhost:3001/auth/introspect"

# Route configurations (matched in order, first prefix match wins)
[[routes]]
name = "auth"
path = "/api/auth/v1"
target = "http://localhost:3001"
rewrite = { pattern = "^/api/auth/v1", replacement = "" }
timeout_secs = 15
retry_count = 2
description = "Auth service"
enabled = true

[[routes]]
name = "users"
path = "/api/users"
target = "http://localhost:3002"
auth_required = true
description = "User service (protected)"
enabled = true

[[routes]]
name = "notify"
path = "/api/notify"
target = "http://localhost:3003"
websocket = true
description = "Deployment event relay"
enabled = true
"#;

    std::fs::write(output_path, sample_config)?;
    println!("Sample configuration written to {}", output_path);
    Ok(())
}

/// Gateway liveness handler
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.health.liveness()))
}

/// Probe every upstream and roll the results up.
/// 200 = all up, 207 = mixed, 503 = all down.
async fn detailed_health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let aggregate = state.monitor.check_all().await;
    let status = match aggregate.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::MULTI_STATUS,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(aggregate))
}

/// Probe a single upstream by route name
async fn service_health_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let target = state
        .monitor
        .find(&name)
        .ok_or_else(|| ApiError::NotFound(format!("no route named '{}'", name)))?
        .clone();

    let health = state.monitor.check(&target).await;
    Ok((StatusCode::OK, Json(health)))
}

/// Metrics handler
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.prometheus_output())
}

/// Proxy handler: rate limit, match a route, authenticate if required,
/// then forward.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request<Body>,
) -> Result<impl IntoResponse, ApiError> {
    if state.limiter.enabled() {
        let client = client_address(&req, addr);
        if !state.limiter.check(&client) {
            warn!(client = %client, "rate limit exceeded");
            return Err(ApiError::TooManyRequests("rate limit exceeded".to_string()));
        }
    }

    let path = req.uri().path().to_string();
    let route = state
        .proxy
        .find_route(&path)
        .ok_or_else(|| ApiError::NotFound(format!("no route matches '{}'", path)))?
        .clone();

    if route.auth_required {
        let claims = state.gate.authenticate(req.headers()).await?;
        inject_identity_headers(req.headers_mut(), &claims);
    }

    state.proxy.forward(&route, req).await
}

/// Client identity for rate limiting: X-Forwarded-For when present (the
/// gateway typically sits behind a load balancer), otherwise the peer address.
fn client_address(req: &Request<Body>, addr: SocketAddr) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}
