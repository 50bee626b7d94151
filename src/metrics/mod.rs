//! Prometheus metrics for the gateway
//!
//! - Request count by method, path, and status
//! - Request latency histogram
//! - Upstream failure counter
//! - Circuit breaker state gauge per upstream

use crate::breaker::CircuitState;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    request_counter: CounterVec,
    request_latency: HistogramVec,
    upstream_failures: CounterVec,
    breaker_state: GaugeVec,
}

impl GatewayMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_counter = CounterVec::new(
            Opts::new("gateway_requests_total", "Total number of requests"),
            &["method", "path", "status"],
        )
        .expect("Failed to create request counter");

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_latency_seconds",
                "Request latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method", "path"],
        )
        .expect("Failed to create latency histogram");

        let upstream_failures = CounterVec::new(
            Opts::new(
                "gateway_upstream_failures_total",
                "Failed upstream attempts (network errors, timeouts, 5xx)",
            ),
            &["upstream"],
        )
        .expect("Failed to create upstream failure counter");

        let breaker_state = GaugeVec::new(
            Opts::new(
                "gateway_breaker_state",
                "Circuit breaker state per upstream (0=closed, 1=open, 2=half-open)",
            ),
            &["upstream"],
        )
        .expect("Failed to create breaker state gauge");

        registry
            .register(Box::new(request_counter.clone()))
            .expect("Failed to register request counter");
        registry
            .register(Box::new(request_latency.clone()))
            .expect("Failed to register latency histogram");
        registry
            .register(Box::new(upstream_failures.clone()))
            .expect("Failed to register upstream failure counter");
        registry
            .register(Box::new(breaker_state.clone()))
            .expect("Failed to register breaker state gauge");

        Self {
            registry,
            request_counter,
            request_latency,
            upstream_failures,
            breaker_state,
        }
    }

    /// Record a request with its status and latency
    pub fn record_request(&self, method: &str, path: &str, status: u16, latency: Duration) {
        let status_str = status.to_string();

        // Normalize path for metrics (to avoid high cardinality)
        let normalized_path = Self::normalize_path(path);

        self.request_counter
            .with_label_values(&[method, &normalized_path, &status_str])
            .inc();

        self.request_latency
            .with_label_values(&[method, &normalized_path])
            .observe(latency.as_secs_f64());
    }

    /// Count a failed upstream attempt (network error, timeout, or 5xx)
    pub fn record_upstream_failure(&self, upstream: &str) {
        self.upstream_failures.with_label_values(&[upstream]).inc();
    }

    /// Publish the breaker state for an upstream
    pub fn set_breaker_state(&self, upstream: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        };
        self.breaker_state.with_label_values(&[upstream]).set(value);
    }

    /// Get the Prometheus metrics output
    pub fn prometheus_output(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    /// Normalize path to reduce cardinality
    /// Replace IDs and numbers with placeholders
    fn normalize_path(path: &str) -> String {
        let parts: Vec<&str> = path.split('/').collect();
        let normalized: Vec<String> = parts
            .iter()
            .map(|part| {
                if part.chars().all(|c| c.is_ascii_digit()) && !part.is_empty() {
                    ":id".to_string()
                } else if part.chars().all(|c| c.is_ascii_hexdigit()) && part.len() >= 8 {
                    ":uuid".to_string()
                } else {
                    (*part).to_string()
                }
            })
            .collect();
        normalized.join("/")
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request() {
        let metrics = GatewayMetrics::new();

        metrics.record_request("GET", "/api/users", 200, Duration::from_millis(10));
        metrics.record_request("POST", "/api/users", 500, Duration::from_millis(50));

        let output = metrics.prometheus_output();
        assert!(output.contains("method=\"GET\""));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("status=\"500\""));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            GatewayMetrics::normalize_path("/api/users/123"),
            "/api/users/:id"
        );
        assert_eq!(
            GatewayMetrics::normalize_path("/api/users/abc123def456"),
            "/api/users/:uuid"
        );
        assert_eq!(GatewayMetrics::normalize_path("/api/users"), "/api/users");
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = GatewayMetrics::new();
        metrics.record_request("GET", "/api/test", 200, Duration::from_millis(10));

        let output = metrics.prometheus_output();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("gateway_request_latency_seconds"));
    }

    #[test]
    fn test_breaker_state_gauge() {
        let metrics = GatewayMetrics::new();

        metrics.set_breaker_state("http://auth:3001", CircuitState::Open);
        metrics.record_upstream_failure("http://auth:3001");

        let output = metrics.prometheus_output();
        assert!(output.contains("gateway_breaker_state"));
        assert!(output.contains("gateway_upstream_failures_total"));
        assert!(output.contains("upstream=\"http://auth:3001\""));
    }
}
