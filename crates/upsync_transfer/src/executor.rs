use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use upsync_contract::{DelayReason, ResultCode, TransferOutcome, UploadRecord};
use upsync_transport::{progress_channel, Transport, TransportContext, TransportError};

use crate::events::EventSink;
use crate::gate::DeviceConditions;
use crate::progress::ProgressReporter;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub delay_in_power_save: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            delay_in_power_save: true,
        }
    }
}

/// Runs one record through the transport and folds the result into a
/// [`TransferOutcome`]. Never retries; never returns an error.
#[derive(Clone)]
pub struct UploadExecutor {
    transport: Arc<dyn Transport>,
    config: ExecutorConfig,
}

impl UploadExecutor {
    pub fn new(transport: Arc<dyn Transport>, config: ExecutorConfig) -> Self {
        Self { transport, config }
    }

    /// Per-record policy stricter than the global gate.
    pub fn policy_delay(
        &self,
        record: &UploadRecord,
        conditions: &DeviceConditions,
    ) -> Option<DelayReason> {
        if record.policy.requires_wifi && !conditions.on_wifi {
            return Some(DelayReason::Wifi);
        }
        if record.policy.requires_charging && !conditions.charging {
            return Some(DelayReason::Charging);
        }
        if self.config.delay_in_power_save && conditions.power_save && !conditions.charging {
            return Some(DelayReason::PowerSave);
        }
        None
    }

    pub async fn run(
        &self,
        context: &TransportContext,
        record: &UploadRecord,
        conditions: &DeviceConditions,
        reporter: &mut ProgressReporter,
        events: &dyn EventSink,
    ) -> TransferOutcome {
        if let Some(reason) = self.policy_delay(record, conditions) {
            debug!(record_id = record.id, reason = reason.as_str(), "upload delayed by policy");
            return TransferOutcome::Delayed(reason);
        }

        match tokio::fs::metadata(&record.local_path).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return TransferOutcome::failure(
                    ResultCode::LocalFileNotFound,
                    format!("{} does not exist", record.local_path.display()),
                );
            }
            Err(err) => {
                warn!(record_id = record.id, error = %err, "local file not readable");
            }
            Ok(_) => {}
        }

        reporter.begin_attempt();
        let (listener, mut samples) = progress_channel();
        let upload = self.transport.upload(context, record, listener);
        tokio::pin!(upload);

        let result = loop {
            tokio::select! {
                result = &mut upload => break result,
                Some(sample) = samples.recv() => {
                    reporter.forward(record, &sample, events);
                }
            }
        };
        // samples queued right before the transport returned
        while let Ok(sample) = samples.try_recv() {
            reporter.forward(record, &sample, events);
        }

        match result {
            Ok(remote) => {
                info!(
                    record_id = record.id,
                    remote_path = %remote.remote_path,
                    size = remote.size,
                    "upload finished"
                );
                TransferOutcome::Success(remote)
            }
            Err(err) => classify(err),
        }
    }
}

fn classify(err: TransportError) -> TransferOutcome {
    let message = err.to_string();
    match err {
        TransportError::LocalFileNotFound(_) => {
            TransferOutcome::failure(ResultCode::LocalFileNotFound, message)
        }
        TransportError::LockFailed => TransferOutcome::failure(ResultCode::LockFailed, message),
        TransportError::Conflict(details) => TransferOutcome::Conflict(details),
        TransportError::Unauthorized => TransferOutcome::failure(ResultCode::Unauthorized, message),
        TransportError::Rejected { status, .. } => {
            let code = match status {
                401 => ResultCode::Unauthorized,
                403 => ResultCode::Forbidden,
                507 => ResultCode::QuotaExceeded,
                500..=599 => ResultCode::ServerError,
                _ => ResultCode::Unknown,
            };
            TransferOutcome::failure(code, message)
        }
        TransportError::Unreachable(_) => {
            TransferOutcome::failure(ResultCode::ConnectionFailed, message)
        }
        TransportError::Cancelled => TransferOutcome::Cancelled,
        TransportError::Io(_) => TransferOutcome::failure(ResultCode::Unknown, message),
    }
}
