//! Health checks: gateway liveness and upstream aggregation
//!
//! `/health` reports the gateway's own liveness. `/health/detailed` probes
//! every configured upstream's health endpoint concurrently and rolls the
//! results up: all up is `healthy` (200), all down is `unhealthy` (503),
//! anything in between is `degraded` (207).

use crate::config::RouteConfig;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Timeout for a single upstream health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Rolled-up health status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Status of a single upstream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamStatus {
    Up,
    Degraded,
    Down,
}

/// Health check response for the gateway itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Result of probing one upstream's health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamHealth {
    pub name: String,
    pub status: UpstreamStatus,
    pub response_time_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate of all upstream probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateHealth {
    pub status: HealthStatus,
    pub services: Vec<UpstreamHealth>,
}

/// Gateway self-health
#[derive(Clone)]
pub struct HealthChecker {
    start_time: Instant,
    version: String,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Liveness: healthy whenever the process is serving.
    pub fn liveness(&self) -> HealthResponse {
        HealthResponse {
            status: HealthStatus::Healthy,
            version: self.version.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// An upstream target to probe
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub name: String,
    pub url: String,
}

impl UpstreamTarget {
    pub fn from_route(route: &RouteConfig) -> Self {
        Self {
            name: route.name.clone(),
            url: format!(
                "{}{}",
                route.target.trim_end_matches('/'),
                route.health_path
            ),
        }
    }
}

/// Classify an upstream response status.
pub fn classify_status(status: u16) -> UpstreamStatus {
    if status < 400 {
        UpstreamStatus::Up
    } else if status < 500 {
        UpstreamStatus::Degraded
    } else {
        UpstreamStatus::Down
    }
}

/// Roll individual upstream statuses up to an overall status.
pub fn aggregate_status(services: &[UpstreamHealth]) -> HealthStatus {
    if services.is_empty() || services.iter().all(|s| s.status == UpstreamStatus::Up) {
        HealthStatus::Healthy
    } else if services.iter().all(|s| s.status == UpstreamStatus::Down) {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

/// Probes upstream health endpoints
#[derive(Clone)]
pub struct UpstreamMonitor {
    client: reqwest::Client,
    targets: Vec<UpstreamTarget>,
}

impl UpstreamMonitor {
    pub fn new(routes: &[RouteConfig]) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let targets = routes
            .iter()
            .filter(|r| r.enabled)
            .map(UpstreamTarget::from_route)
            .collect();

        Self { client, targets }
    }

    pub fn targets(&self) -> &[UpstreamTarget] {
        &self.targets
    }

    pub fn find(&self, name: &str) -> Option<&UpstreamTarget> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Probe one upstream. Network failure or timeout yields `down` with the
    /// error surfaced; a response is classified by status code.
    pub async fn check(&self, target: &UpstreamTarget) -> UpstreamHealth {
        let start = Instant::now();

        match self.client.get(&target.url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                UpstreamHealth {
                    name: target.name.clone(),
                    status: classify_status(status),
                    response_time_ms: start.elapsed().as_millis(),
                    status_code: Some(status),
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(upstream = %target.name, error = %e, "health probe failed");
                UpstreamHealth {
                    name: target.name.clone(),
                    status: UpstreamStatus::Down,
                    response_time_ms: start.elapsed().as_millis(),
                    status_code: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Probe all configured upstreams concurrently and aggregate.
    pub async fn check_all(&self) -> AggregateHealth {
        let probes = self.targets.iter().map(|t| self.check(t));
        let services = join_all(probes).await;

        AggregateHealth {
            status: aggregate_status(&services),
            services,
        }
    }
}
