use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{decode_canonical, encode_canonical, CodecError};
use crate::record::{AccountName, RecordId};

/// Raw invocation parameters as handed over by the outer scheduler.
///
/// Every mandatory field is optional here so that a malformed hand-off can be
/// rejected by [`BatchInput::validate`] instead of failing to deserialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchInput {
    pub account: Option<AccountName>,
    pub record_ids: Option<Vec<RecordId>>,
    pub batch_index: Option<i64>,
    pub total_upload_size: Option<i64>,
    #[serde(default)]
    pub suppress_same_file_notification: bool,
    pub destination_label: Option<String>,
}

/// A validated batch, owned by the orchestrator for the duration of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub account: AccountName,
    pub record_ids: Vec<RecordId>,
    pub batch_index: usize,
    pub total_upload_size: usize,
    pub suppress_same_file_notification: bool,
    pub destination_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidBatch {
    #[error("account name is missing")]
    MissingAccount,
    #[error("record id list is missing or empty")]
    MissingRecordIds,
    #[error("batch index is missing")]
    MissingBatchIndex,
    #[error("batch index {0} is negative")]
    NegativeBatchIndex(i64),
    #[error("total upload size is missing")]
    MissingTotalSize,
    #[error("total upload size {0} is negative")]
    NegativeTotalSize(i64),
}

impl BatchInput {
    pub fn validate(self) -> Result<Batch, InvalidBatch> {
        let account = self
            .account
            .filter(|name| !name.trim().is_empty())
            .ok_or(InvalidBatch::MissingAccount)?;
        let record_ids = self
            .record_ids
            .filter(|ids| !ids.is_empty())
            .ok_or(InvalidBatch::MissingRecordIds)?;
        let batch_index = self.batch_index.ok_or(InvalidBatch::MissingBatchIndex)?;
        let batch_index =
            usize::try_from(batch_index).map_err(|_| InvalidBatch::NegativeBatchIndex(batch_index))?;
        let total = self.total_upload_size.ok_or(InvalidBatch::MissingTotalSize)?;
        let total_upload_size =
            usize::try_from(total).map_err(|_| InvalidBatch::NegativeTotalSize(total))?;

        Ok(Batch {
            account,
            record_ids,
            batch_index,
            total_upload_size,
            suppress_same_file_notification: self.suppress_same_file_notification,
            destination_label: self.destination_label,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode_canonical(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        decode_canonical(bytes)
    }
}
