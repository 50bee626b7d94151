//! Configuration for the gateway and the auth service
//!
//! Both binaries load a TOML file at startup. Secrets can be supplied (or
//! overridden) through the environment: `PYLON_JWT_SECRET` wins over the
//! file for both the gateway's auth gate and the auth service.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Environment variable overriding the configured JWT shared secret.
pub const JWT_SECRET_ENV: &str = "PYLON_JWT_SECRET";

fn default_enabled() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Server bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// CORS configuration. An empty origin list disables the layer;
/// a single "*" allows any origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Fixed-window rate limiting, keyed by client address. Disabled by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
    #[serde(default = "default_rate_max")]
    pub max_requests: u32,
}

fn default_rate_window() -> u64 {
    60
}

fn default_rate_max() -> u32 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_secs: default_rate_window(),
            max_requests: default_rate_max(),
        }
    }
}

/// Circuit breaker tuning shared by all upstream breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> u64 {
    30
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout(),
        }
    }
}

/// Auth gate configuration (gateway-side token verification).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthGateConfig {
    /// Shared HS256 secret; `PYLON_JWT_SECRET` overrides this.
    #[serde(default)]
    pub jwt_secret: String,
    /// How long verified claims are served from the cache
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Optional token-introspection endpoint on the auth service.
    /// Best-effort: if unreachable, locally verified claims are used.
    #[serde(default)]
    pub introspect_url: Option<String>,
    #[serde(default = "default_introspect_timeout")]
    pub introspect_timeout_secs: u64,
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_introspect_timeout() -> u64 {
    2
}

impl Default for AuthGateConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            cache_ttl_secs: default_cache_ttl(),
            introspect_url: None,
            introspect_timeout_secs: default_introspect_timeout(),
        }
    }
}

/// Regex-style search/replace applied once to the matched path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteConfig {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

/// Route configuration. Order in the file is matching order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route name, used in health reporting and diagnostic headers
    pub name: String,
    /// Path prefix to match (e.g., "/api/auth/v1")
    pub path: String,
    /// Upstream base URL
    pub target: String,
    /// Optional path rewrite, compiled once at load time
    #[serde(default)]
    pub rewrite: Option<RewriteConfig>,
    /// Per-route upstream timeout in seconds
    #[serde(default = "default_route_timeout")]
    pub timeout_secs: u64,
    /// Retry attempts for retryable failures (0 = no retries)
    #[serde(default)]
    pub retry_count: u32,
    /// Health endpoint on the upstream
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Marks routes carrying WebSocket traffic (metadata; upgrades are not proxied)
    #[serde(default)]
    pub websocket: bool,
    /// Whether the auth gate must validate a bearer token before forwarding
    #[serde(default)]
    pub auth_required: bool,
    /// Additional headers added to the forwarded request
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_route_timeout() -> u64 {
    30
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub auth_gate: AuthGateConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file and apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let mut config: GatewayConfig = toml::from_str(s)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var(JWT_SECRET_ENV) {
            if !secret.is_empty() {
                self.auth_gate.jwt_secret = secret;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        for route in &self.routes {
            if route.target.is_empty() {
                anyhow::bail!("Route '{}' has an empty target", route.name);
            }
            if !route.path.starts_with('/') {
                anyhow::bail!(
                    "Route '{}' path '{}' must start with '/'",
                    route.name,
                    route.path
                );
            }
            if let Some(rewrite) = &route.rewrite {
                regex::Regex::new(&rewrite.pattern).map_err(|e| {
                    anyhow::anyhow!(
                        "Route '{}' has an invalid rewrite pattern '{}': {}",
                        route.name,
                        rewrite.pattern,
                        e
                    )
                })?;
            }
            if route.auth_required && self.auth_gate.jwt_secret.is_empty() {
                anyhow::bail!(
                    "Route '{}' requires authentication but no JWT secret is configured \
                     (set [auth_gate] jwt_secret or {})",
                    route.name,
                    JWT_SECRET_ENV
                );
            }
        }

        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("Breaker failure_threshold must be at least 1");
        }
        if self.rate_limit.enabled && self.rate_limit.max_requests == 0 {
            anyhow::bail!("Rate limiting is enabled but max_requests is 0");
        }

        Ok(())
    }

    /// Get enabled routes in configuration order.
    pub fn enabled_routes(&self) -> Vec<&RouteConfig> {
        self.routes.iter().filter(|r| r.enabled).collect()
    }
}

/// Auth microservice configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Shared HS256 secret; `PYLON_JWT_SECRET` overrides this.
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_access_ttl")]
    pub access_ttl_mins: i64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_days: i64,
    /// Failed logins before the account locks
    #[serde(default = "default_lockout_attempts")]
    pub lockout_max_attempts: u32,
    /// Lock duration in seconds
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: i64,
    /// When true, internal error detail is included in responses
    #[serde(default)]
    pub diagnostic_mode: bool,
}

fn default_issuer() -> String {
    "pylon-auth".to_string()
}

fn default_access_ttl() -> i64 {
    15
}

fn default_refresh_ttl() -> i64 {
    7
}

fn default_lockout_attempts() -> u32 {
    5
}

fn default_lockout_secs() -> i64 {
    900
}

impl Default for AuthServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            log_level: default_log_level(),
            jwt_secret: String::new(),
            issuer: default_issuer(),
            access_ttl_mins: default_access_ttl(),
            refresh_ttl_days: default_refresh_ttl(),
            lockout_max_attempts: default_lockout_attempts(),
            lockout_secs: default_lockout_secs(),
            diagnostic_mode: false,
        }
    }
}

impl AuthServiceConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let mut config: AuthServiceConfig = toml::from_str(s)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var(JWT_SECRET_ENV) {
            if !secret.is_empty() {
                self.jwt_secret = secret;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jwt_secret.is_empty() {
            anyhow::bail!(
                "No JWT secret configured (set jwt_secret or {})",
                JWT_SECRET_ENV
            );
        }
        if self.access_ttl_mins <= 0 || self.refresh_ttl_days <= 0 {
            anyhow::bail!("Token TTLs must be positive");
        }
        if self.lockout_max_attempts == 0 {
            anyhow::bail!("lockout_max_attempts must be at least 1");
        }
        Ok(())
    }
}
