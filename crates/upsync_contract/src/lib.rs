pub mod batch;
pub mod codec;
pub mod event;
pub mod outcome;
pub mod record;

pub use batch::{Batch, BatchInput, InvalidBatch};
pub use codec::{decode_canonical, encode_canonical, CodecError};
pub use event::{MilestoneBroadcast, Notification, UploadEvent};
pub use outcome::{percent, ConflictDetails, ProgressSample, RemoteFile, TransferOutcome};
pub use record::{
    AccountName, DelayReason, LocalAction, NameCollisionPolicy, ParseStatusError, RecordId,
    ResultCode, UploadPolicy, UploadRecord, UploadStatus,
};
