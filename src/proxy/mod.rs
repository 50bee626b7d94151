//! Request routing and forwarding
//!
//! Routes are matched by path prefix, first match in configuration order.
//! Forwarding copies method and a filtered header set, applies the route's
//! compiled path rewrite once, buffers the body for methods that carry one,
//! and relays the upstream response unchanged apart from diagnostic headers
//! (`X-Served-By`, `X-Response-Time`, `X-Request-ID`).
//!
//! Every outbound attempt is bounded by the route timeout and guarded by the
//! upstream's circuit breaker. Retryable failures (no-response network
//! errors, 5xx, 408, 429) are retried with exponential backoff while the
//! breaker admits calls; an open circuit short-circuits with 503 before any
//! socket is opened.

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::config::RouteConfig;
use crate::error::ApiError;
use crate::metrics::GatewayMetrics;
use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Base delay for exponential retry backoff, doubled per attempt.
const RETRY_BASE_DELAY_MS: u64 = 100;

type ProxyBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

/// Compiled path rewrite: regex search/replace applied once.
#[derive(Clone)]
pub struct PathRewrite {
    regex: Regex,
    replacement: String,
}

impl PathRewrite {
    pub fn new(pattern: &str, replacement: &str) -> anyhow::Result<Self> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            replacement: replacement.to_string(),
        })
    }

    /// Apply the rewrite. A non-matching pattern leaves the path unchanged.
    pub fn apply(&self, path: &str) -> String {
        self.regex
            .replace(path, self.replacement.as_str())
            .into_owned()
    }
}

/// A compiled proxy route
#[derive(Clone)]
pub struct ProxyRoute {
    pub name: String,
    /// Path prefix to match
    pub prefix: String,
    /// Upstream base URL without trailing slash
    pub target: String,
    pub rewrite: Option<PathRewrite>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub health_path: String,
    pub websocket: bool,
    pub auth_required: bool,
    /// Additional headers added to forwarded requests
    pub headers: HashMap<String, String>,
}

impl ProxyRoute {
    pub fn from_config(route: &RouteConfig) -> anyhow::Result<Self> {
        let rewrite = route
            .rewrite
            .as_ref()
            .map(|r| PathRewrite::new(&r.pattern, &r.replacement))
            .transpose()?;

        Ok(Self {
            name: route.name.clone(),
            prefix: route.path.clone(),
            target: route.target.trim_end_matches('/').to_string(),
            rewrite,
            timeout: Duration::from_secs(route.timeout_secs),
            retry_count: route.retry_count,
            health_path: route.health_path.clone(),
            websocket: route.websocket,
            auth_required: route.auth_required,
            headers: route.headers.clone(),
        })
    }

    /// Prefix match against an incoming request path.
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// Build the outbound URL: rewrite applied once, query preserved.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let rewritten = match &self.rewrite {
            Some(rewrite) => rewrite.apply(path),
            None => path.to_string(),
        };
        let path_part = if rewritten.starts_with('/') {
            rewritten
        } else {
            format!("/{}", rewritten)
        };

        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.target, path_part, q),
            _ => format!("{}{}", self.target, path_part),
        }
    }
}

/// First configured route whose prefix matches the path.
pub fn first_match<'a>(routes: &'a [ProxyRoute], path: &str) -> Option<&'a ProxyRoute> {
    routes.iter().find(|r| r.matches(path))
}

/// Proxy service owning the outbound client and the breaker registry
pub struct ProxyService {
    client: Client<HttpConnector, ProxyBody>,
    routes: Vec<ProxyRoute>,
    breakers: BreakerRegistry,
    metrics: Arc<GatewayMetrics>,
}

impl ProxyService {
    pub fn new(
        routes: Vec<ProxyRoute>,
        breaker_config: BreakerConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self {
            client,
            routes,
            breakers: BreakerRegistry::new(breaker_config),
            metrics,
        }
    }

    /// Compile proxy routes from configuration, preserving order.
    pub fn routes_from_config(routes: &[RouteConfig]) -> anyhow::Result<Vec<ProxyRoute>> {
        routes
            .iter()
            .filter(|r| r.enabled)
            .map(ProxyRoute::from_config)
            .collect()
    }

    pub fn find_route(&self, path: &str) -> Option<&ProxyRoute> {
        first_match(&self.routes, path)
    }

    pub fn routes(&self) -> &[ProxyRoute] {
        &self.routes
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Forward a request along a matched route.
    pub async fn forward(
        &self,
        route: &ProxyRoute,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(|q| q.to_string());

        // Hop-by-hop stripping forecloses upgrade tunnelling; flagged routes
        // reject upgrades outright instead of forwarding a broken handshake.
        if route.websocket && req.headers().contains_key(axum::http::header::UPGRADE) {
            warn!(route = %route.name, "rejecting upgrade request on websocket route");
            return Err(ApiError::BadGateway(
                "websocket upgrades are not proxied".to_string(),
            ));
        }

        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let target_url = route.target_url(&path, query.as_deref());
        let outbound_headers = filter_request_headers(req.headers(), route, &target_url);

        // Buffer the body once for methods that carry one; Content-Length is
        // recomputed by hyper from the buffered body.
        let body_bytes = if method_carries_body(&method) {
            let (_parts, body) = req.into_parts();
            axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| ApiError::Internal(format!("failed to read request body: {}", e)))?
        } else {
            bytes::Bytes::new()
        };

        let breaker = self.breakers.get(&route.target);
        let mut last_error: Option<ApiError> = None;

        for attempt in 0..=route.retry_count {
            if let Err(e) = breaker.try_acquire() {
                self.metrics
                    .set_breaker_state(&route.target, breaker.state());
                if attempt == 0 {
                    debug!(route = %route.name, error = %e, "short-circuiting request");
                    self.metrics
                        .record_request(method.as_str(), &path, 503, start.elapsed());
                    return Err(ApiError::ServiceUnavailable(
                        "upstream temporarily unavailable".to_string(),
                    ));
                }
                // Circuit opened mid-retry; stop retrying.
                break;
            }

            if attempt > 0 {
                let backoff = RETRY_BASE_DELAY_MS * (1u64 << (attempt - 1));
                let jitter = rand::thread_rng().gen_range(0..RETRY_BASE_DELAY_MS / 2);
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }

            let outbound = build_outbound_request(
                &method,
                &target_url,
                &outbound_headers,
                body_bytes.clone(),
            )
            .map_err(|e| ApiError::Internal(format!("failed to build request: {}", e)))?;

            match tokio::time::timeout(route.timeout, self.client.request(outbound)).await {
                Ok(Ok(response)) => {
                    let status = response.status();

                    // 5xx counts against the breaker; 4xx is the client's
                    // problem, not the upstream's.
                    if status.is_server_error() {
                        breaker.record_failure();
                        self.metrics.record_upstream_failure(&route.target);
                    } else {
                        breaker.record_success();
                    }
                    self.metrics
                        .set_breaker_state(&route.target, breaker.state());

                    if is_retryable_status(status) && attempt < route.retry_count {
                        debug!(
                            route = %route.name,
                            status = status.as_u16(),
                            attempt,
                            "retrying after retryable upstream status"
                        );
                        continue;
                    }

                    let relayed = relay_response(response, route, &request_id, start);
                    self.metrics.record_request(
                        method.as_str(),
                        &path,
                        status.as_u16(),
                        start.elapsed(),
                    );
                    return Ok(relayed);
                }
                Ok(Err(e)) => {
                    breaker.record_failure();
                    self.metrics.record_upstream_failure(&route.target);
                    self.metrics
                        .set_breaker_state(&route.target, breaker.state());
                    warn!(route = %route.name, error = %e, attempt, "upstream request failed");
                    last_error = Some(ApiError::BadGateway("upstream unreachable".to_string()));
                }
                Err(_elapsed) => {
                    breaker.record_failure();
                    self.metrics.record_upstream_failure(&route.target);
                    self.metrics
                        .set_breaker_state(&route.target, breaker.state());
                    warn!(
                        route = %route.name,
                        timeout_secs = route.timeout.as_secs(),
                        attempt,
                        "upstream request timed out"
                    );
                    last_error =
                        Some(ApiError::GatewayTimeout("upstream timed out".to_string()));
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| ApiError::ServiceUnavailable("upstream temporarily unavailable".to_string()));
        self.metrics.record_request(
            method.as_str(),
            &path,
            error.status().as_u16(),
            start.elapsed(),
        );
        Err(error)
    }
}

fn method_carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Retryable upstream statuses: 5xx, 408, 429.
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Hop-by-hop headers that must not be forwarded. Host is included because
/// it is replaced from the target URL; Content-Length because the body is
/// re-buffered and recomputed.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn filter_request_headers(headers: &HeaderMap, route: &ProxyRoute, target_url: &str) -> HeaderMap {
    let mut filtered = HeaderMap::new();

    for (key, value) in headers.iter() {
        if !is_hop_by_hop_header(key.as_str()) {
            filtered.insert(key.clone(), value.clone());
        }
    }

    // Host comes from the target so virtual-hosted upstreams resolve correctly
    if let Some(host) = extract_host_from_url(target_url) {
        if let Ok(value) = host.parse::<HeaderValue>() {
            filtered.insert(axum::http::header::HOST, value);
        }
    }

    for (key, value) in &route.headers {
        if let (Ok(name), Ok(value)) = (key.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
            filtered.insert(name, value);
        }
    }

    filtered
}

fn build_outbound_request(
    method: &Method,
    target_url: &str,
    headers: &HeaderMap,
    body: bytes::Bytes,
) -> Result<Request<ProxyBody>, axum::http::Error> {
    let mut builder = Request::builder().method(method.clone()).uri(target_url);

    if let Some(outbound_headers) = builder.headers_mut() {
        *outbound_headers = headers.clone();
    }

    let boxed_body = http_body_util::Full::new(body)
        .map_err(|e| match e {})
        .boxed();

    builder.body(boxed_body)
}

/// Relay the upstream response: status unchanged, body streamed through
/// without buffering, hop-by-hop headers stripped, diagnostic headers added.
fn relay_response(
    response: Response<hyper::body::Incoming>,
    route: &ProxyRoute,
    request_id: &str,
    start: Instant,
) -> Response<Body> {
    let (mut parts, body) = response.into_parts();

    let hop_by_hop: Vec<HeaderName> = parts
        .headers
        .keys()
        .filter(|k| is_hop_by_hop_header(k.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        parts.headers.remove(name);
    }

    if let Ok(value) = HeaderValue::from_str(&route.name) {
        parts.headers.insert("x-served-by", value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{}ms", start.elapsed().as_millis())) {
        parts.headers.insert("x-response-time", value);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        parts.headers.insert("x-request-id", value);
    }

    Response::from_parts(parts, Body::new(body))
}

/// Extract host and optional port from a URL string
fn extract_host_from_url(url: &str) -> Option<String> {
    url.parse::<axum::http::Uri>()
        .ok()
        .and_then(|uri| uri.authority().map(|a| a.to_string()))
}
