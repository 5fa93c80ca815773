use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use upsync_contract::{ConflictDetails, ProgressSample, RemoteFile, UploadRecord};

/// Authenticated handle for one account, as produced by an [`AccountResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportContext {
    pub account: String,
    pub endpoint: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("local file {} not found", .0.display())]
    LocalFileNotFound(PathBuf),
    #[error("remote resource is locked")]
    LockFailed,
    #[error("remote resource {} changed unexpectedly", .0.remote_path)]
    Conflict(ConflictDetails),
    #[error("credentials rejected by server")]
    Unauthorized,
    #[error("server rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes-on-the-wire capability. Implementations own retries below the
/// request level; the orchestrator never retries within a batch.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transfers `record` and reports progress through `progress` until it returns.
    async fn upload(
        &self,
        context: &TransportContext,
        record: &UploadRecord,
        progress: ProgressListener,
    ) -> Result<RemoteFile, TransportError>;

    async fn is_same_file_on_remote(
        &self,
        context: &TransportContext,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<bool, TransportError>;

    async fn copy_to_collection(
        &self,
        context: &TransportContext,
        remote_path: &str,
        collection: &str,
    ) -> Result<(), TransportError>;
}

#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn resolve(&self, account: &str) -> Option<TransportContext>;
}

/// Write half of a per-attempt progress subscription.
///
/// Not `Clone`: the listener is moved into a single [`Transport::upload`] call
/// and the subscription ends when that call drops it.
#[derive(Debug)]
pub struct ProgressListener {
    tx: mpsc::UnboundedSender<ProgressSample>,
}

pub fn progress_channel() -> (ProgressListener, mpsc::UnboundedReceiver<ProgressSample>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressListener { tx }, rx)
}

impl ProgressListener {
    pub fn report(&self, bytes_transferred: u64, bytes_total: u64, file_name: &str) {
        self.report_sample(ProgressSample {
            bytes_transferred,
            bytes_total,
            file_name: file_name.to_string(),
            at: Instant::now(),
        });
    }

    pub fn report_sample(&self, sample: ProgressSample) {
        // receiver gone means nobody is listening anymore
        let _ = self.tx.send(sample);
    }
}
