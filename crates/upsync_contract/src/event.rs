use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{AccountName, RecordId, ResultCode, UploadStatus};

/// User-facing notification requests. Rendering is up to the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Started {
        record_id: RecordId,
        file_name: String,
        current_index: usize,
        total: usize,
    },
    Progress {
        record_id: RecordId,
        file_name: String,
        percent: u8,
    },
    Failed {
        record_id: RecordId,
        file_name: String,
        code: ResultCode,
        message: String,
        needs_credentials: bool,
    },
    Conflict {
        record_id: RecordId,
        file_name: String,
        remote_path: String,
    },
    Paused,
    ConnectionError,
}

/// Batch-boundary progress event for UI consumption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MilestoneBroadcast {
    pub run_id: Uuid,
    pub record_id: RecordId,
    pub remote_path: String,
    pub status: UploadStatus,
    pub old_local_path: PathBuf,
    pub completed: usize,
    pub total: usize,
    pub is_final: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UploadEvent {
    BatchStarted {
        run_id: Uuid,
        account: AccountName,
    },
    Notification(Notification),
    Milestone(MilestoneBroadcast),
    BatchFinished {
        run_id: Uuid,
        account: AccountName,
        success: bool,
        last_local_path: Option<PathBuf>,
    },
}

impl UploadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BatchStarted { .. } => "upload.batch.started",
            Self::Notification(_) => "upload.notification",
            Self::Milestone(_) => "upload.milestone",
            Self::BatchFinished { .. } => "upload.batch.finished",
        }
    }
}
