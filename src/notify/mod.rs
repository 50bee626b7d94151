//! Deployment-event relay
//!
//! A deliberately small service: deployment pipelines POST events, connected
//! WebSocket clients receive them as JSON text frames. Events are fanned out
//! over a broadcast channel; nothing is persisted, and a client that connects
//! after an event was published never sees it. Slow clients that fall behind
//! the channel capacity miss events rather than stalling the relay.

use crate::health::HealthChecker;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Events buffered per subscriber before the slowest client starts
/// missing them.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub pipeline: String,
    pub service: String,
    /// Free-form status string ("started", "succeeded", "failed", ...)
    pub status: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

pub struct Relay {
    sender: broadcast::Sender<DeploymentEvent>,
    health: HealthChecker,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            health: HealthChecker::new(),
        }
    }

    /// Publish an event to all connected clients. Returns the number of
    /// clients that received it.
    pub fn publish(&self, event: DeploymentEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Build the relay router.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/events", post(publish_handler))
        .route("/health", get(health_handler))
        .with_state(relay)
}

async fn ws_handler(
    State(relay): State<Arc<Relay>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let receiver = relay.subscribe();
    upgrade.on_upgrade(move |socket| forward_events(socket, receiver))
}

async fn forward_events(mut socket: WebSocket, mut receiver: broadcast::Receiver<DeploymentEvent>) {
    debug!("websocket client connected");
    loop {
        match receiver.recv().await {
            Ok(event) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            // Lagging clients skip missed events and keep going
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "websocket client lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("websocket client disconnected");
}

async fn publish_handler(
    State(relay): State<Arc<Relay>>,
    Json(event): Json<DeploymentEvent>,
) -> impl IntoResponse {
    let delivered = relay.publish(event.clone());
    info!(
        pipeline = %event.pipeline,
        service = %event.service,
        status = %event.status,
        delivered,
        "deployment event published"
    );
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "delivered": delivered })))
}

async fn health_handler(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    (StatusCode::OK, Json(relay.health.liveness()))
}
