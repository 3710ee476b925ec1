//! Bearer token authentication.

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Claims read from an HS256 token.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// User id as issued by the account service
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    pub exp: u64,
}

impl Claims {
    /// User id, preferring `id` over `sub`.
    pub fn uid(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or(self.sub.as_deref())
            .filter(|uid| !uid.is_empty())
    }
}

/// Verifies HS256 tokens against a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| ApiError::unauthorized(format!("Token validation failed: {}", e)))?;
        Ok(data.claims)
    }
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub uid: String,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Token from the `Authorization` header, or from `?token=` for clients that
/// cannot set headers (browser WebSocket and EventSource).
fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(Authorization(bearer)) = parts.headers.typed_get::<Authorization<Bearer>>() {
        return Some(bearer.token().to_string());
    }
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.token)
        .filter(|token| !token.is_empty())
}

/// Axum extractor for authenticated user.
#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or_else(|| ApiError::unauthorized("Missing token"))?;

        let claims = state.jwt.verify(&token)?;
        let uid = claims
            .uid()
            .ok_or_else(|| ApiError::unauthorized("Token has no user id"))?
            .to_string();

        debug!(uid = %uid, "Authenticated request");
        Ok(AuthUser { uid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn token(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    #[test]
    fn test_uid_prefers_id_claim() {
        let verifier = JwtVerifier::new("s3cret");
        let claims = verifier
            .verify(&token(json!({"id": "u-1", "sub": "other", "exp": exp()}), "s3cret"))
            .unwrap();
        assert_eq!(claims.uid(), Some("u-1"));

        let claims = verifier
            .verify(&token(json!({"sub": "u-2", "exp": exp()}), "s3cret"))
            .unwrap();
        assert_eq!(claims.uid(), Some("u-2"));
    }

    #[test]
    fn test_rejects_wrong_secret_and_expired() {
        let verifier = JwtVerifier::new("s3cret");
        assert!(verifier
            .verify(&token(json!({"id": "u", "exp": exp()}), "other"))
            .is_err());
        assert!(verifier
            .verify(&token(json!({"id": "u", "exp": 1_000}), "s3cret"))
            .is_err());
    }

    #[test]
    fn test_token_from_header_or_query() {
        let (parts, _) = Request::builder()
            .uri("/api/upload-url")
            .header("Authorization", "Bearer abc.def.ghi")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer_token(&parts).as_deref(), Some("abc.def.ghi"));

        let (parts, _) = Request::builder()
            .uri("/sse/job1?token=xyz")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer_token(&parts).as_deref(), Some("xyz"));

        let (parts, _) = Request::builder().uri("/sse/job1").body(()).unwrap().into_parts();
        assert_eq!(bearer_token(&parts), None);
    }
}
