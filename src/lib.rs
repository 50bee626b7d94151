//! Pylon - API gateway with circuit breaking and an auth microservice
//!
//! The library crate backs three binaries:
//! - `pylon-gateway`: reverse proxy with per-upstream circuit breakers,
//!   upstream health aggregation, a JWT auth gate with a token cache,
//!   and Prometheus metrics
//! - `pylon-auth`: user registration/login/JWT issuance microservice
//! - `pylon-notify`: WebSocket relay for CI/CD deployment events

pub mod auth_gate;
pub mod auth_service;
pub mod breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod proxy;
pub mod rate_limit;

pub use config::{AuthServiceConfig, GatewayConfig};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
