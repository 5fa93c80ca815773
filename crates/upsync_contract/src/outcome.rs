use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::record::{DelayReason, ResultCode, UploadStatus};

/// Remote object produced by a successful transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFile {
    pub remote_path: String,
    pub etag: Option<String>,
    pub size: u64,
}

/// Transport-reported mismatch between expected and actual remote state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictDetails {
    pub remote_path: String,
    pub expected_etag: Option<String>,
    pub remote_etag: Option<String>,
}

/// Result of one executor run. Every attempt ends in exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success(RemoteFile),
    Conflict(ConflictDetails),
    Failure { code: ResultCode, message: String },
    Delayed(DelayReason),
    Cancelled,
}

impl TransferOutcome {
    pub fn failure(code: ResultCode, message: impl Into<String>) -> Self {
        Self::Failure {
            code,
            message: message.into(),
        }
    }

    /// Status persisted for this outcome.
    pub fn status(&self) -> UploadStatus {
        match self {
            Self::Success(_) => UploadStatus::Succeeded,
            Self::Conflict(_) => UploadStatus::Conflict,
            Self::Failure { code, .. } => UploadStatus::Failed(*code),
            Self::Delayed(reason) => UploadStatus::Delayed(*reason),
            Self::Cancelled => UploadStatus::Cancelled,
        }
    }

    pub fn failure_message(&self) -> Option<&str> {
        match self {
            Self::Failure { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }
}

/// Byte-level progress callback payload. Never persisted.
#[derive(Debug, Clone)]
pub struct ProgressSample {
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub file_name: String,
    pub at: Instant,
}

impl ProgressSample {
    pub fn percent(&self) -> u8 {
        percent(self.bytes_transferred, self.bytes_total)
    }
}

/// `floor(transferred * 100 / total)` clamped to `0..=100`; a zero total is 0%.
pub fn percent(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let scaled = u128::from(transferred) * 100 / u128::from(total);
    scaled.min(100) as u8
}
