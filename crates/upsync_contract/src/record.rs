use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type RecordId = i64;
pub type AccountName = String;

/// What the remote side should do when the target path is already taken.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NameCollisionPolicy {
    #[default]
    Rename,
    Replace,
    Cancel,
    AskUser,
}

/// What happens to the local source once the remote copy is materialized.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LocalAction {
    #[default]
    None,
    KeepLocal,
    DeleteLocal,
}

/// Immutable per-record transfer policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadPolicy {
    #[serde(default)]
    pub name_collision: NameCollisionPolicy,
    #[serde(default)]
    pub requires_wifi: bool,
    #[serde(default)]
    pub requires_charging: bool,
    #[serde(default)]
    pub local_action: LocalAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    LocalFileNotFound,
    LockFailed,
    Unauthorized,
    Forbidden,
    QuotaExceeded,
    ServerError,
    ConnectionFailed,
    Unknown,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalFileNotFound => "local_file_not_found",
            Self::LockFailed => "lock_failed",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ServerError => "server_error",
            Self::ConnectionFailed => "connection_failed",
            Self::Unknown => "unknown",
        }
    }

    /// Missing sources and lock contention are not something the user can act on.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Self::LocalFileNotFound | Self::LockFailed)
    }
}

impl FromStr for ResultCode {
    type Err = ParseStatusError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let code = match raw {
            "local_file_not_found" => Self::LocalFileNotFound,
            "lock_failed" => Self::LockFailed,
            "unauthorized" => Self::Unauthorized,
            "forbidden" => Self::Forbidden,
            "quota_exceeded" => Self::QuotaExceeded,
            "server_error" => Self::ServerError,
            "connection_failed" => Self::ConnectionFailed,
            "unknown" => Self::Unknown,
            other => return Err(ParseStatusError::UnknownDetail(other.to_string())),
        };
        Ok(code)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DelayReason {
    Wifi,
    Charging,
    PowerSave,
}

impl DelayReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wifi => "wifi",
            Self::Charging => "charging",
            Self::PowerSave => "power_save",
        }
    }
}

impl FromStr for DelayReason {
    type Err = ParseStatusError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "wifi" => Ok(Self::Wifi),
            "charging" => Ok(Self::Charging),
            "power_save" => Ok(Self::PowerSave),
            other => Err(ParseStatusError::UnknownDetail(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseStatusError {
    #[error("unknown upload status {0:?}")]
    UnknownStatus(String),
    #[error("unknown status detail {0:?}")]
    UnknownDetail(String),
    #[error("status {0:?} requires a detail value")]
    MissingDetail(String),
}

/// Persisted lifecycle of one upload record.
///
/// `Queued`, `InProgress` and `Delayed` are open states; everything else is
/// terminal for the current attempt and only an external requeue reopens it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum UploadStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed(ResultCode),
    Delayed(DelayReason),
    Cancelled,
    Conflict,
}

impl UploadStatus {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::Delayed(_) => "delayed",
            Self::Cancelled => "cancelled",
            Self::Conflict => "conflict",
        }
    }

    pub fn detail(&self) -> Option<&'static str> {
        match self {
            Self::Failed(code) => Some(code.as_str()),
            Self::Delayed(reason) => Some(reason.as_str()),
            _ => None,
        }
    }

    pub fn from_parts(kind: &str, detail: Option<&str>) -> Result<Self, ParseStatusError> {
        let status = match kind {
            "queued" => Self::Queued,
            "in_progress" => Self::InProgress,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed(
                detail
                    .ok_or_else(|| ParseStatusError::MissingDetail(kind.to_string()))?
                    .parse()?,
            ),
            "delayed" => Self::Delayed(
                detail
                    .ok_or_else(|| ParseStatusError::MissingDetail(kind.to_string()))?
                    .parse()?,
            ),
            "cancelled" => Self::Cancelled,
            "conflict" => Self::Conflict,
            other => return Err(ParseStatusError::UnknownStatus(other.to_string())),
        };
        Ok(status)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed(_) | Self::Cancelled | Self::Conflict
        )
    }

    /// Terminal states are final; leaving one requires an explicit requeue.
    pub fn can_transition_to(&self, next: &UploadStatus) -> bool {
        !self.is_terminal() && *next != UploadStatus::Queued
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{}({})", self.kind(), detail),
            None => f.write_str(self.kind()),
        }
    }
}

/// One requested file-to-remote-path transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadRecord {
    pub id: RecordId,
    pub account: AccountName,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub policy: UploadPolicy,
    pub status: UploadStatus,
}

impl UploadRecord {
    pub fn file_name(&self) -> String {
        self.remote_path
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(self.remote_path.as_str())
            .to_string()
    }
}
