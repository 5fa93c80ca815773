use async_trait::async_trait;
use thiserror::Error;
use upsync_contract::{RecordId, TransferOutcome, UploadRecord, UploadStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload records not found: {ids:?}")]
    NotFound { ids: Vec<RecordId> },
    #[error("upload {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: RecordId,
        from: UploadStatus,
        to: UploadStatus,
    },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Durable table of upload requests, as consumed by the orchestrator.
///
/// Implementations must make every write visible atomically to concurrent
/// readers; the orchestrator is the single writer per record.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Returns records in the order of `ids`. Any missing id fails the whole call.
    async fn load_records(
        &self,
        ids: &[RecordId],
        account: &str,
    ) -> Result<Vec<UploadRecord>, StoreError>;

    async fn mark_in_progress(&self, id: RecordId) -> Result<(), StoreError>;

    /// Persists the status derived from `outcome` and returns it.
    async fn update_result(
        &self,
        record: &UploadRecord,
        outcome: &TransferOutcome,
    ) -> Result<UploadStatus, StoreError>;

    /// Drops every record of `account` targeting `remote_path`; returns how many went.
    async fn remove_record(&self, account: &str, remote_path: &str) -> Result<u64, StoreError>;
}
