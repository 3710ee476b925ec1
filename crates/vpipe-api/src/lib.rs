//! Axum HTTP API server.
//!
//! This crate provides:
//! - Upload URL issuance and transcode submission endpoints
//! - Live progress over WebSocket and Server-Sent Events
//! - JWT authentication, per-IP rate limiting and security headers
//! - Health, readiness and Prometheus metrics endpoints

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::{ApiConfig, RecordsBackend};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
