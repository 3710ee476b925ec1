//! Firestore REST API client.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{info_span, Instrument};

use super::auth::{AccessTokenSource, GcpTokenSource, StaticToken};
use super::metrics::record_request;
use super::retry::{with_retry, RetryConfig};
use super::types::{Document, Value};
use crate::error::{RecordError, RecordResult};

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// GCP project ID
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    /// `host:port` of a local emulator; skips Google auth when set
    pub emulator_host: Option<String>,
    /// Request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Retry configuration
    pub retry: RetryConfig,
}

impl FirestoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> RecordResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .or_else(|_| std::env::var("FIREBASE_PROJECT_ID"))
            .ok()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                RecordError::auth_error(
                    "GCP_PROJECT_ID or FIREBASE_PROJECT_ID must be set to access Firestore",
                )
            })?;

        let connect_timeout_secs: u64 = std::env::var("FIRESTORE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            project_id,
            database_id: std::env::var("FIRESTORE_DATABASE_ID")
                .unwrap_or_else(|_| "(default)".to_string()),
            emulator_host: std::env::var("FIRESTORE_EMULATOR_HOST")
                .ok()
                .filter(|h| !h.is_empty()),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            retry: RetryConfig::from_env(),
        })
    }

    fn base_url(&self) -> String {
        match &self.emulator_host {
            Some(host) => format!(
                "http://{}/v1/projects/{}/databases/{}/documents",
                host, self.project_id, self.database_id
            ),
            None => format!(
                "https://firestore.googleapis.com/v1/projects/{}/databases/{}/documents",
                self.project_id, self.database_id
            ),
        }
    }
}

/// Firestore REST API client.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    retry: RetryConfig,
    base_url: String,
    tokens: Arc<dyn AccessTokenSource>,
}

impl FirestoreClient {
    /// Create a client, using the emulator or application default credentials.
    pub async fn new(config: FirestoreConfig) -> RecordResult<Self> {
        let tokens: Arc<dyn AccessTokenSource> = if config.emulator_host.is_some() {
            Arc::new(StaticToken("owner".to_string()))
        } else {
            Arc::new(GcpTokenSource::from_env().await?)
        };
        let base_url = config.base_url();
        Self::with_base_url(config, base_url, tokens)
    }

    /// Create a client against an explicit documents root URL.
    pub fn with_base_url(
        config: FirestoreConfig,
        base_url: impl Into<String>,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> RecordResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("vpipe-records/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(RecordError::Network)?;

        Ok(Self {
            http,
            retry: config.retry,
            base_url: base_url.into(),
            tokens,
        })
    }

    /// Create from environment variables.
    pub async fn from_env() -> RecordResult<Self> {
        Self::new(FirestoreConfig::from_env()?).await
    }

    fn document_url(&self, collection: &str, doc_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            collection,
            urlencoding::encode(doc_id)
        )
    }

    fn is_access_token_expired(body: &str) -> bool {
        body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
    }

    /// Send with a bearer token, refreshing it once on an expired-token 401.
    async fn send_authorized<B>(&self, url: &str, build: B) -> RecordResult<Response>
    where
        B: Fn(&str) -> RequestBuilder,
    {
        let token = self.tokens.access_token().await?;
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if !Self::is_access_token_expired(&body) {
            return Err(RecordError::from_http_status(
                401,
                format!("{} failed: {}", url, body),
            ));
        }

        self.tokens.invalidate().await;
        let token = self.tokens.access_token().await?;
        Ok(build(&token).send().await?)
    }

    /// Get a document.
    pub async fn get_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> RecordResult<Option<Document>> {
        let url = self.document_url(collection, doc_id);

        self.execute_request("get_document", collection, doc_id, || async {
            let response = self
                .send_authorized(&url, |token| self.http.get(&url).bearer_auth(token))
                .await?;

            match response.status() {
                StatusCode::OK => Ok(Some(response.json().await?)),
                StatusCode::NOT_FOUND => Ok(None),
                status => Err(Self::error_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Create a document; fails with `AlreadyExists` if the id is taken.
    pub async fn create_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
    ) -> RecordResult<Document> {
        let url = format!(
            "{}/{}?documentId={}",
            self.base_url,
            collection,
            urlencoding::encode(doc_id)
        );
        let body = Document::new(fields);

        self.execute_request("create_document", collection, doc_id, || async {
            let response = self
                .send_authorized(&url, |token| {
                    self.http.post(&url).bearer_auth(token).json(&body)
                })
                .await?;

            match response.status() {
                StatusCode::OK | StatusCode::CREATED => Ok(response.json().await?),
                StatusCode::CONFLICT => Err(RecordError::AlreadyExists(format!(
                    "{}/{}",
                    collection, doc_id
                ))),
                status => Err(Self::error_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Patch the masked fields, only if the document is unchanged since `update_time`.
    pub async fn update_document_with_precondition(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
        update_mask: &[&str],
        update_time: &str,
    ) -> RecordResult<Document> {
        let mut query: Vec<(&str, &str)> = update_mask
            .iter()
            .map(|field| ("updateMask.fieldPaths", *field))
            .collect();
        query.push(("currentDocument.updateTime", update_time));

        let url = self.document_url(collection, doc_id);
        let body = Document::new(fields);

        self.execute_request("update_document", collection, doc_id, || async {
            let response = self
                .send_authorized(&url, |token| {
                    self.http
                        .patch(&url)
                        .query(&query)
                        .bearer_auth(token)
                        .json(&body)
                })
                .await?;

            match response.status() {
                StatusCode::OK => Ok(response.json().await?),
                StatusCode::NOT_FOUND => {
                    Err(RecordError::not_found(format!("{}/{}", collection, doc_id)))
                }
                StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
                    Err(RecordError::PreconditionFailed(format!(
                        "{}/{} changed since {}",
                        collection, doc_id, update_time
                    )))
                }
                status => Err(Self::error_response(status, &url, response).await),
            }
        })
        .await
    }

    async fn execute_request<T, F, Fut>(
        &self,
        operation: &str,
        collection: &str,
        doc_id: &str,
        op: F,
    ) -> RecordResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RecordResult<T>>,
    {
        let span = info_span!(
            "firestore_request",
            operation = %operation,
            collection = %collection,
            doc_id = %doc_id
        );

        let start = Instant::now();
        let result = with_retry(&self.retry, operation, op).instrument(span).await;
        let latency_ms = start.elapsed().as_millis() as f64;

        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, latency_ms);

        result
    }

    async fn error_response(status: StatusCode, url: &str, response: Response) -> RecordError {
        let body = response.text().await.unwrap_or_default();
        RecordError::from_http_status(status.as_u16(), format!("{} failed: {}", url, body))
    }
}
