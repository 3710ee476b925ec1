//! Video records stored as Firestore documents.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use vpipe_models::{JobId, VideoRecord, VideoStatus};

use super::client::FirestoreClient;
use super::types::{Document, ToFirestoreValue, Value};
use crate::error::{RecordError, RecordResult};
use crate::repository::{StatusChange, VideoRepository};

/// Top-level collection; document id is the job id.
pub const VIDEOS_COLLECTION: &str = "videos";

/// Read-compare-write rounds before giving up on a contended status update.
const MAX_STATUS_UPDATE_ATTEMPTS: u32 = 3;

/// Repository for video records in the `videos` collection.
#[derive(Clone)]
pub struct FirestoreVideoRepository {
    client: FirestoreClient,
}

impl FirestoreVideoRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    fn to_fields(record: &VideoRecord) -> HashMap<String, Value> {
        HashMap::from([
            ("title".to_string(), record.title.to_firestore_value()),
            (
                "description".to_string(),
                record.description.to_firestore_value(),
            ),
            ("owner_id".to_string(), record.owner_id.to_firestore_value()),
            (
                "upload_timestamp".to_string(),
                record.upload_timestamp.to_firestore_value(),
            ),
            (
                "status".to_string(),
                record.status.as_str().to_firestore_value(),
            ),
        ])
    }

    fn status_of(id: &JobId, doc: &Document) -> RecordResult<VideoStatus> {
        let raw: String = doc
            .field("status")
            .ok_or_else(|| RecordError::invalid_document(format!("{id}: missing status")))?;
        VideoStatus::from_str(&raw).map_err(|e| RecordError::invalid_document(format!("{id}: {e}")))
    }

    fn from_document(id: &JobId, doc: &Document) -> RecordResult<VideoRecord> {
        Ok(VideoRecord {
            id: id.clone(),
            title: doc.field("title").unwrap_or_default(),
            description: doc.field("description").unwrap_or_default(),
            owner_id: doc
                .field("owner_id")
                .ok_or_else(|| RecordError::invalid_document(format!("{id}: missing owner_id")))?,
            upload_timestamp: doc
                .field::<DateTime<Utc>>("upload_timestamp")
                .unwrap_or_else(Utc::now),
            status: Self::status_of(id, doc)?,
        })
    }
}

#[async_trait]
impl VideoRepository for FirestoreVideoRepository {
    async fn create(&self, record: &VideoRecord) -> RecordResult<()> {
        self.client
            .create_document(
                VIDEOS_COLLECTION,
                record.id.as_str(),
                Self::to_fields(record),
            )
            .await?;
        info!(job_id = %record.id, owner_id = %record.owner_id, "Created video record");
        Ok(())
    }

    async fn get(&self, id: &JobId) -> RecordResult<Option<VideoRecord>> {
        match self.client.get_document(VIDEOS_COLLECTION, id.as_str()).await? {
            Some(doc) => Ok(Some(Self::from_document(id, &doc)?)),
            None => Ok(None),
        }
    }

    async fn update_status(&self, id: &JobId, status: VideoStatus) -> RecordResult<StatusChange> {
        for attempt in 1..=MAX_STATUS_UPDATE_ATTEMPTS {
            let doc = self
                .client
                .get_document(VIDEOS_COLLECTION, id.as_str())
                .await?
                .ok_or_else(|| RecordError::not_found(format!("{VIDEOS_COLLECTION}/{id}")))?;

            let current = Self::status_of(id, &doc)?;
            if current == status {
                debug!(job_id = %id, status = %status, "Status already set");
                return Ok(StatusChange::Unchanged);
            }
            if !current.can_transition_to(status) {
                return Err(RecordError::InvalidTransition {
                    id: id.to_string(),
                    from: current,
                    to: status,
                });
            }

            let update_time = doc.update_time.as_deref().ok_or_else(|| {
                RecordError::invalid_document(format!("{id}: missing updateTime"))
            })?;
            let fields = HashMap::from([(
                "status".to_string(),
                status.as_str().to_firestore_value(),
            )]);

            match self
                .client
                .update_document_with_precondition(
                    VIDEOS_COLLECTION,
                    id.as_str(),
                    fields,
                    &["status"],
                    update_time,
                )
                .await
            {
                Ok(_) => {
                    info!(job_id = %id, from = %current, to = %status, "Updated video status");
                    return Ok(StatusChange::Applied);
                }
                Err(e) if e.is_precondition_failed() => {
                    warn!(job_id = %id, attempt, "Video changed during status update, re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        Err(RecordError::Conflict(format!(
            "{VIDEOS_COLLECTION}/{id}: status update contended"
        )))
    }

    async fn exists_with_status(&self, id: &JobId, status: VideoStatus) -> RecordResult<bool> {
        match self.client.get_document(VIDEOS_COLLECTION, id.as_str()).await? {
            Some(doc) => Ok(Self::status_of(id, &doc)? == status),
            None => Ok(false),
        }
    }

    async fn probe(&self) -> RecordResult<()> {
        // Reading a document that never exists still exercises auth and connectivity.
        self.client
            .get_document(VIDEOS_COLLECTION, "__readiness_probe__")
            .await
            .map(|_| ())
    }
}
