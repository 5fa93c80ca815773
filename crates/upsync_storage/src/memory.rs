use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use upsync_contract::{RecordId, TransferOutcome, UploadRecord, UploadStatus};

use crate::repository::NewUpload;
use crate::store::{StoreError, UploadStore};

/// Process-local store for embedding and tests. Same transition rules as SQLite.
#[derive(Debug, Default)]
pub struct InMemoryUploadStore {
    inner: RwLock<MemoryTable>,
}

#[derive(Debug, Default)]
struct MemoryTable {
    next_id: RecordId,
    records: BTreeMap<RecordId, UploadRecord>,
    history: Vec<(RecordId, UploadStatus)>,
}

impl InMemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, upload: NewUpload) -> UploadRecord {
        let mut table = self.inner.write().await;
        table.next_id += 1;
        let record = UploadRecord {
            id: table.next_id,
            account: upload.account,
            local_path: upload.local_path,
            remote_path: upload.remote_path,
            policy: upload.policy,
            status: UploadStatus::Queued,
        };
        table.records.insert(record.id, record.clone());
        record
    }

    pub async fn get(&self, id: RecordId) -> Option<UploadRecord> {
        self.inner.read().await.records.get(&id).cloned()
    }

    pub async fn requeue(&self, id: RecordId) -> bool {
        let mut table = self.inner.write().await;
        match table.records.get_mut(&id) {
            Some(record) if record.status != UploadStatus::InProgress => {
                record.status = UploadStatus::Queued;
                true
            }
            _ => false,
        }
    }

    /// Every status written through `update_result`, in write order.
    pub async fn result_history(&self) -> Vec<(RecordId, UploadStatus)> {
        self.inner.read().await.history.clone()
    }

    async fn transition(&self, id: RecordId, next: UploadStatus) -> Result<(), StoreError> {
        let mut table = self.inner.write().await;
        let record = table
            .records
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound { ids: vec![id] })?;
        if !record.status.can_transition_to(&next) {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.status,
                to: next,
            });
        }
        record.status = next;
        Ok(())
    }
}

#[async_trait]
impl UploadStore for InMemoryUploadStore {
    async fn load_records(
        &self,
        ids: &[RecordId],
        account: &str,
    ) -> Result<Vec<UploadRecord>, StoreError> {
        let table = self.inner.read().await;
        let mut records = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match table.records.get(id).filter(|record| record.account == account) {
                Some(record) => records.push(record.clone()),
                None => missing.push(*id),
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::NotFound { ids: missing });
        }
        Ok(records)
    }

    async fn mark_in_progress(&self, id: RecordId) -> Result<(), StoreError> {
        self.transition(id, UploadStatus::InProgress).await
    }

    async fn update_result(
        &self,
        record: &UploadRecord,
        outcome: &TransferOutcome,
    ) -> Result<UploadStatus, StoreError> {
        let status = outcome.status();
        self.transition(record.id, status).await?;
        self.inner.write().await.history.push((record.id, status));
        Ok(status)
    }

    async fn remove_record(&self, account: &str, remote_path: &str) -> Result<u64, StoreError> {
        let mut table = self.inner.write().await;
        let before = table.records.len();
        table
            .records
            .retain(|_, record| !(record.account == account && record.remote_path == remote_path));
        Ok((before - table.records.len()) as u64)
    }
}
