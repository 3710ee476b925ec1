//! In-memory repository.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use vpipe_models::{JobId, VideoRecord, VideoStatus};

use crate::error::{RecordError, RecordResult};
use crate::repository::{StatusChange, VideoRepository};

/// Records held in process memory. Lost on restart.
#[derive(Default)]
pub struct MemoryVideoRepository {
    records: RwLock<HashMap<JobId, VideoRecord>>,
    status_writes: AtomicUsize,
}

impl MemoryVideoRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of status transitions applied so far.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl VideoRepository for MemoryVideoRepository {
    async fn create(&self, record: &VideoRecord) -> RecordResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(RecordError::AlreadyExists(record.id.to_string()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> RecordResult<Option<VideoRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update_status(&self, id: &JobId, status: VideoStatus) -> RecordResult<StatusChange> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RecordError::not_found(id.to_string()))?;

        if record.status == status {
            return Ok(StatusChange::Unchanged);
        }
        if !record.status.can_transition_to(status) {
            return Err(RecordError::InvalidTransition {
                id: id.to_string(),
                from: record.status,
                to: status,
            });
        }

        record.status = status;
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        debug!(job_id = %id, status = %status, "Updated record status");
        Ok(StatusChange::Applied)
    }

    async fn exists_with_status(&self, id: &JobId, status: VideoStatus) -> RecordResult<bool> {
        Ok(self
            .records
            .read()
            .await
            .get(id)
            .is_some_and(|r| r.status == status))
    }
}
