//! Upload URL issuance.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use vpipe_models::{original_object_key, JobId, VideoRecord};
use vpipe_records::VideoRepository;
use vpipe_storage::UploadUrlSigner;

use crate::error::{PipelineError, PipelineResult};
use crate::metrics::record_upload_issued;

/// What the client needs to upload the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    pub job_id: JobId,
    pub upload_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Mints job ids, presigns the upload and registers the video record.
pub struct UploadCoordinator {
    signer: Arc<dyn UploadUrlSigner>,
    repository: Arc<dyn VideoRepository>,
    url_ttl: Duration,
}

impl UploadCoordinator {
    pub fn new(
        signer: Arc<dyn UploadUrlSigner>,
        repository: Arc<dyn VideoRepository>,
        url_ttl: Duration,
    ) -> Self {
        Self {
            signer,
            repository,
            url_ttl,
        }
    }

    /// Issue an upload URL for a new job and create its record in `PROCESSING`.
    ///
    /// The URL is signed before the record is written, so a storage failure leaves
    /// nothing behind. A record write failure leaves an unused URL that simply expires.
    pub async fn request_upload(
        &self,
        owner_id: &str,
        title: &str,
        description: &str,
    ) -> PipelineResult<UploadTicket> {
        let job_id = JobId::generate();
        let key = original_object_key(&job_id);

        let presigned = self
            .signer
            .presign_upload(&key, self.url_ttl)
            .await
            .map_err(|e| {
                warn!(job_id = %job_id, "Failed to presign upload: {}", e);
                PipelineError::StorageUnavailable(e)
            })?;

        let record = VideoRecord::processing(job_id.clone(), owner_id, title, description);
        self.repository.create(&record).await?;

        record_upload_issued();
        info!(job_id = %job_id, owner_id = %owner_id, "Issued upload URL");

        Ok(UploadTicket {
            job_id,
            upload_url: presigned.url,
            expires_at: presigned.expires_at,
        })
    }
}
