//! Access tokens for Firestore requests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use gcp_auth::TokenProvider;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{RecordError, RecordResult};

/// Refresh margin: refresh token 60 seconds before expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Conservative token TTL when expiry is unknown.
const TOKEN_DEFAULT_TTL: Duration = Duration::from_secs(50 * 60);

/// OAuth scope for Firestore/Datastore access.
pub const FIRESTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

/// Supplies bearer tokens.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> RecordResult<String>;

    /// Drop any cached token so the next call fetches a fresh one.
    async fn invalidate(&self) {}
}

/// Fixed token, as accepted by the Firestore emulator.
pub struct StaticToken(pub String);

#[async_trait]
impl AccessTokenSource for StaticToken {
    async fn access_token(&self) -> RecordResult<String> {
        Ok(self.0.clone())
    }
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }

    fn is_usable(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Google credentials discovered from the environment, with a token cache.
pub struct GcpTokenSource {
    provider: Arc<dyn TokenProvider>,
    cache: RwLock<Option<CachedToken>>,
}

impl GcpTokenSource {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(None),
        }
    }

    /// Use application default credentials.
    pub async fn from_env() -> RecordResult<Self> {
        let provider = gcp_auth::provider()
            .await
            .map_err(|e| RecordError::auth_error(format!("No Google credentials found: {e}")))?;
        Ok(Self::new(provider))
    }
}

#[async_trait]
impl AccessTokenSource for GcpTokenSource {
    async fn access_token(&self) -> RecordResult<String> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref().filter(|c| c.is_valid()) {
                return Ok(cached.access_token.clone());
            }
        }

        let mut cache = self.cache.write().await;

        // Another task may have refreshed while we waited
        if let Some(cached) = cache.as_ref().filter(|c| c.is_valid()) {
            return Ok(cached.access_token.clone());
        }

        match self.provider.token(&[FIRESTORE_SCOPE]).await {
            Ok(token) => {
                let now = Utc::now();
                let ttl = (token.expires_at() - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(TOKEN_DEFAULT_TTL);
                let access_token = token.as_str().to_string();
                *cache = Some(CachedToken {
                    access_token: access_token.clone(),
                    expires_at: Instant::now() + ttl,
                });
                debug!(ttl_secs = ttl.as_secs(), "Refreshed Firestore auth token");
                Ok(access_token)
            }
            Err(e) => match cache.as_ref().filter(|c| c.is_usable()) {
                Some(cached) => {
                    warn!("Token refresh failed, using existing token: {}", e);
                    Ok(cached.access_token.clone())
                }
                None => Err(RecordError::auth_error(format!(
                    "Failed to obtain auth token: {e}"
                ))),
            },
        }
    }

    async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
