//! End-to-end tests for the gateway binary
//!
//! These tests start the gateway server against mock upstreams and verify
//! routing, rewriting, circuit breaking, and health aggregation.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

/// Base port for tests, incremented atomically to avoid conflicts
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19000);

/// Get a unique port for testing
fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Minimal HTTP upstream: answers every request with the given status and a
/// JSON body echoing the request path.
fn spawn_mock_upstream(status: u16) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

            let body = format!("{{\"path\":\"{}\"}}", path);
            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    port
}

/// Upstream that answers its first `failures` requests with `fail_status`,
/// then 200. Every response body carries the running hit count.
fn spawn_flaky_upstream(failures: usize, fail_status: u16) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let mut hits = 0usize;
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            hits += 1;

            let status = if hits <= failures { fail_status } else { 200 };
            let body = format!("{{\"hits\":{}}}", hits);
            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    port
}

/// Config with a single route that retries twice against the given upstream.
fn create_retry_config(port: u16, upstream_port: u16) -> tempfile::NamedTempFile {
    let config = format!(
        r#"
[server]
host = "127.0.0.1"
port = {port}

log_level = "warn"

[[routes]]
name = "flaky"
path = "/api/flaky"
target = "http://127.0.0.1:{upstream_port}"
timeout_secs = 5
retry_count = 2
enabled = true
"#
    );

    let file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    std::fs::write(file.path(), config).unwrap();
    file
}

/// Create a temporary config file routing to the given upstream port.
/// The "down" route points at a port nothing listens on.
fn create_test_config(port: u16, upstream_port: u16) -> tempfile::NamedTempFile {
    let config = format!(
        r#"
[server]
host = "127.0.0.1"
port = {port}

log_level = "warn"

[metrics]
enabled = true
path = "/metrics"

[breaker]
failure_threshold = 5
reset_timeout_secs = 30

[auth_gate]
jwt_secret = "e2e-test-secret"

[[routes]]
name = "svc"
path = "/api/svc"
target = "http://127.0.0.1:{upstream_port}"
rewrite = {{ pattern = "^/api/svc", replacement = "" }}
timeout_secs = 5
enabled = true

[[routes]]
name = "down"
path = "/api/down"
target = "http://127.0.0.1:1"
timeout_secs = 2
enabled = true

[[routes]]
name = "private"
path = "/api/private"
target = "http://127.0.0.1:{upstream_port}"
auth_required = true
enabled = true
"#
    );

    let file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    std::fs::write(file.path(), config).unwrap();
    file
}

/// Start the gateway server
fn start_server(config_path: &str) -> Child {
    Command::new(env!("CARGO_BIN_EXE_pylon-gateway"))
        .args(["start", "-c", config_path])
        .spawn()
        .expect("Failed to start gateway server")
}

/// Wait for the server to be ready by polling the health endpoint
fn wait_for_server(port: u16, timeout_secs: u64) -> bool {
    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    while start.elapsed() < timeout {
        if let Ok(response) = client.get(format!("http://127.0.0.1:{}/health", port)).send() {
            if response.status().is_success() {
                return true;
            }
        }
        thread::sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn test_health_endpoint() {
    let port = get_unique_port();
    let upstream = spawn_mock_upstream(200);
    let config_file = create_test_config(port, upstream);
    let mut server = start_server(config_file.path().to_str().unwrap());

    assert!(
        wait_for_server(port, 10),
        "Server failed to start within timeout"
    );

    let client = reqwest::blocking::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .expect("Failed to send request");

    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
    assert!(body["uptime_seconds"].is_number());

    server.kill().ok();
}

#[test]
fn test_metrics_endpoint() {
    let port = get_unique_port();
    let upstream = spawn_mock_upstream(200);
    let config_file = create_test_config(port, upstream);
    let mut server = start_server(config_file.path().to_str().unwrap());

    assert!(
        wait_for_server(port, 10),
        "Server failed to start within timeout"
    );

    let client = reqwest::blocking::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/metrics", port))
        .send()
        .expect("Failed to send request");

    assert!(response.status().is_success());

    let body = response.text().unwrap();
    assert!(body.contains("gateway_") || body.contains("# HELP") || body.is_empty());

    server.kill().ok();
}

#[test]
fn test_forwarding_applies_rewrite() {
    let port = get_unique_port();
    let upstream = spawn_mock_upstream(200);
    let config_file = create_test_config(port, upstream);
    let mut server = start_server(config_file.path().to_str().unwrap());

    assert!(
        wait_for_server(port, 10),
        "Server failed to start within timeout"
    );

    let client = reqwest::blocking::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/api/svc/me", port))
        .send()
        .expect("Failed to send request");

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("x-served-by").unwrap(),
        "svc"
    );
    assert!(response.headers().contains_key("x-request-id"));

    // The upstream saw the rewritten path
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["path"], "/me");

    server.kill().ok();
}

#[test]
fn test_large_response_body_is_relayed() {
    let port = get_unique_port();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream = listener.local_addr().unwrap().port();

    // Upstream serving a 4 MiB payload
    const PAYLOAD_LEN: usize = 4 * 1024 * 1024;
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                PAYLOAD_LEN
            );
            let _ = stream.write_all(head.as_bytes());
            let chunk = vec![b'x'; 64 * 1024];
            let mut remaining = PAYLOAD_LEN;
            while remaining > 0 {
                let n = remaining.min(chunk.len());
                if stream.write_all(&chunk[..n]).is_err() {
                    break;
                }
                remaining -= n;
            }
        }
    });

    let config_file = create_test_config(port, upstream);
    let mut server = start_server(config_file.path().to_str().unwrap());

    assert!(
        wait_for_server(port, 10),
        "Server failed to start within timeout"
    );

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let response = client
        .get(format!("http://127.0.0.1:{}/api/svc/blob", port))
        .send()
        .expect("Failed to send request");

    assert_eq!(response.status().as_u16(), 200);
    let body = response.bytes().unwrap();
    assert_eq!(body.len(), PAYLOAD_LEN);
    assert!(body.iter().all(|&b| b == b'x'));

    server.kill().ok();
}

#[test]
fn test_retries_until_upstream_recovers() {
    let port = get_unique_port();
    // Two 500s, then success; retry_count = 2 covers them
    let upstream = spawn_flaky_upstream(2, 500);
    let config_file = create_retry_config(port, upstream);
    let mut server = start_server(config_file.path().to_str().unwrap());

    assert!(
        wait_for_server(port, 10),
        "Server failed to start within timeout"
    );

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let response = client
        .get(format!("http://127.0.0.1:{}/api/flaky/x", port))
        .send()
        .expect("Failed to send request");

    assert_eq!(response.status().as_u16(), 200);

    // The upstream saw the original attempt plus two retries
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["hits"], 3);

    server.kill().ok();
}

#[test]
fn test_client_errors_are_not_retried() {
    let port = get_unique_port();
    // Always answers 404
    let upstream = spawn_flaky_upstream(usize::MAX, 404);
    let config_file = create_retry_config(port, upstream);
    let mut server = start_server(config_file.path().to_str().unwrap());

    assert!(
        wait_for_server(port, 10),
        "Server failed to start within timeout"
    );

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let response = client
        .get(format!("http://127.0.0.1:{}/api/flaky/x", port))
        .send()
        .expect("Failed to send request");

    // Relayed as-is, and the upstream was hit exactly once despite retry_count = 2
    assert_eq!(response.status().as_u16(), 404);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["hits"], 1);

    server.kill().ok();
}

#[test]
fn test_unmatched_route_returns_404() {
    let port = get_unique_port();
    let upstream = spawn_mock_upstream(200);
    let config_file = create_test_config(port, upstream);
    let mut server = start_server(config_file.path().to_str().unwrap());

    assert!(
        wait_for_server(port, 10),
        "Server failed to start within timeout"
    );

    let client = reqwest::blocking::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/nonexistent", port))
        .send()
        .expect("Failed to send request");

    assert_eq!(response.status().as_u16(), 404);

    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert!(body["error"]["timestamp"].is_string());

    server.kill().ok();
}

#[test]
fn test_protected_route_requires_token() {
    let port = get_unique_port();
    let upstream = spawn_mock_upstream(200);
    let config_file = create_test_config(port, upstream);
    let mut server = start_server(config_file.path().to_str().unwrap());

    assert!(
        wait_for_server(port, 10),
        "Server failed to start within timeout"
    );

    let client = reqwest::blocking::Client::new();

    // No token
    let response = client
        .get(format!("http://127.0.0.1:{}/api/private/data", port))
        .send()
        .expect("Failed to send request");
    assert_eq!(response.status().as_u16(), 401);

    // Garbage token
    let response = client
        .get(format!("http://127.0.0.1:{}/api/private/data", port))
        .header("authorization", "Bearer not-a-jwt")
        .send()
        .expect("Failed to send request");
    assert_eq!(response.status().as_u16(), 401);

    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["error"]["code"], "AUTHENTICATION_ERROR");

    server.kill().ok();
}

#[test]
fn test_circuit_breaker_opens_after_failures() {
    let port = get_unique_port();
    let upstream = spawn_mock_upstream(200);
    let config_file = create_test_config(port, upstream);
    let mut server = start_server(config_file.path().to_str().unwrap());

    assert!(
        wait_for_server(port, 10),
        "Server failed to start within timeout"
    );

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let url = format!("http://127.0.0.1:{}/api/down/x", port);

    // First five attempts reach the (refused) upstream and fail with 502
    for i in 0..5 {
        let response = client.get(&url).send().expect("Failed to send request");
        assert_eq!(
            response.status().as_u16(),
            502,
            "attempt {} should reach the upstream",
            i
        );
    }

    // The breaker is now open: the sixth call is short-circuited with 503
    let response = client.get(&url).send().expect("Failed to send request");
    assert_eq!(response.status().as_u16(), 503);

    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");

    server.kill().ok();
}

#[test]
fn test_detailed_health_is_degraded_with_one_upstream_down() {
    let port = get_unique_port();
    let upstream = spawn_mock_upstream(200);
    let config_file = create_test_config(port, upstream);
    let mut server = start_server(config_file.path().to_str().unwrap());

    assert!(
        wait_for_server(port, 10),
        "Server failed to start within timeout"
    );

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let response = client
        .get(format!("http://127.0.0.1:{}/health/detailed", port))
        .send()
        .expect("Failed to send request");

    // "svc" and "private" are up, "down" is not: 207 Multi-Status
    assert_eq!(response.status().as_u16(), 207);

    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["status"], "degraded");
    let services = body["services"].as_array().unwrap();
    assert_eq!(services.len(), 3);
    assert!(services
        .iter()
        .any(|s| s["name"] == "down" && s["status"] == "down"));
    assert!(services
        .iter()
        .any(|s| s["name"] == "svc" && s["status"] == "up"));

    server.kill().ok();
}

#[test]
fn test_single_service_health() {
    let port = get_unique_port();
    let upstream = spawn_mock_upstream(200);
    let config_file = create_test_config(port, upstream);
    let mut server = start_server(config_file.path().to_str().unwrap());

    assert!(
        wait_for_server(port, 10),
        "Server failed to start within timeout"
    );

    let client = reqwest::blocking::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/health/service/svc", port))
        .send()
        .expect("Failed to send request");
    assert_eq!(response.status().as_u16(), 200);

    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["name"], "svc");
    assert_eq!(body["status"], "up");

    // Unknown route name is a 404
    let response = client
        .get(format!("http://127.0.0.1:{}/health/service/ghost", port))
        .send()
        .expect("Failed to send request");
    assert_eq!(response.status().as_u16(), 404);

    server.kill().ok();
}
