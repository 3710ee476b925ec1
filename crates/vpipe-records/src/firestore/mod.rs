//! Firestore REST backend.
//!
//! - Token caching with refresh margin, or a static token against the emulator
//! - Exponential backoff with jitter on transient failures
//! - Tracing spans and request metrics around every call

pub mod auth;
pub mod client;
pub mod metrics;
pub mod retry;
pub mod types;
pub mod videos;

pub use auth::{AccessTokenSource, GcpTokenSource, StaticToken};
pub use client::{FirestoreClient, FirestoreConfig};
pub use retry::RetryConfig;
pub use videos::FirestoreVideoRepository;
