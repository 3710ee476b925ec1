//! S3 client implementation.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Content type uploads are signed for; the client must send the same header.
pub const VIDEO_CONTENT_TYPE: &str = "video/mp4";

/// A write-only URL for one object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUpload {
    pub url: String,
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues time-limited upload URLs.
#[async_trait]
pub trait UploadUrlSigner: Send + Sync {
    /// Presign a PUT for `key`, valid for `expires_in`.
    async fn presign_upload(&self, key: &str, expires_in: Duration)
        -> StorageResult<PresignedUpload>;

    /// Bucket the signed keys live in.
    fn bucket(&self) -> &str;

    /// Check that the bucket is reachable with the configured credentials.
    async fn check_connectivity(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Configuration for the S3 client.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 API endpoint URL
    pub endpoint_url: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Bucket name
    pub bucket_name: String,
    /// Region ("auto" works for most S3-compatible services)
    pub region: String,
}

impl S3Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: std::env::var("S3_ENDPOINT")
                .map_err(|_| StorageError::config_error("S3_ENDPOINT not set"))?,
            access_key_id: std::env::var("S3_ACCESS_KEY_ID")
                .map_err(|_| StorageError::config_error("S3_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("S3_SECRET_ACCESS_KEY")
                .map_err(|_| StorageError::config_error("S3_SECRET_ACCESS_KEY not set"))?,
            bucket_name: std::env::var("S3_BUCKET_NAME").unwrap_or_else(|_| "video".to_string()),
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "auto".to_string()),
        })
    }
}

/// S3-compatible storage client.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Create a new client from configuration.
    pub fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "vpipe",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket_name,
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self::new(S3Config::from_env()?))
    }
}

#[async_trait]
impl UploadUrlSigner for S3Storage {
    async fn presign_upload(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> StorageResult<PresignedUpload> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        let presign_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::presign_failed(e.to_string()))?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(VIDEO_CONTENT_TYPE)
            .presigned(presign_config)
            .await
            .map_err(|e| StorageError::presign_failed(e.to_string()))?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(expires_in)
                .map_err(|e| StorageError::presign_failed(e.to_string()))?;

        debug!(key = %key, expires_at = %expires_at, "Presigned upload URL");

        Ok(PresignedUpload {
            url: presigned.uri().to_string(),
            key: key.to_string(),
            expires_at,
        })
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::AwsSdk(format!("S3 connectivity check failed: {}", e)))?;
        Ok(())
    }
}
