//! API configuration.

use std::str::FromStr;
use std::time::Duration;

/// Where video records are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordsBackend {
    Firestore,
    /// Process memory; for local development only.
    Memory,
}

impl FromStr for RecordsBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "firestore" => Ok(Self::Firestore),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown records backend: {other}")),
        }
    }
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Rate limit requests per second, per client IP
    pub rate_limit_rps: u32,
    /// Max request body size
    pub max_body_size: usize,
    /// Environment (development/production)
    pub environment: String,
    /// HMAC secret for bearer tokens
    pub jwt_secret: String,
    /// Interval between WebSocket pings
    pub ws_heartbeat: Duration,
    pub records_backend: RecordsBackend,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            rate_limit_rps: 10,
            max_body_size: 64 * 1024,
            environment: "development".to_string(),
            jwt_secret: String::new(),
            ws_heartbeat: Duration::from_secs(30),
            records_backend: RecordsBackend::Firestore,
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            rate_limit_rps: std::env::var("RATE_LIMIT_RPS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rate_limit_rps),
            max_body_size: std::env::var("MAX_BODY_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_body_size),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or_default(),
            ws_heartbeat: defaults.ws_heartbeat,
            records_backend: std::env::var("RECORDS_BACKEND")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.records_backend),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }

    /// Reject settings the server must not start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jwt_secret.is_empty() {
            anyhow::bail!("JWT_SECRET must be set");
        }
        if self.is_production() && self.records_backend == RecordsBackend::Memory {
            anyhow::bail!("RECORDS_BACKEND=memory is not allowed in production");
        }
        Ok(())
    }
}
