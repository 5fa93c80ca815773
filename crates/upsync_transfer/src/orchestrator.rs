use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use upsync_contract::{
    Batch, BatchInput, InvalidBatch, MilestoneBroadcast, Notification, RecordId, TransferOutcome,
    UploadEvent, UploadRecord, UploadStatus,
};
use upsync_storage::{StoreError, UploadStore};
use upsync_transport::{AccountResolver, Transport, TransportContext};
use uuid::Uuid;

use crate::conflict::{apply_local_action, ConflictResolver, Resolution};
use crate::events::EventSink;
use crate::executor::{ExecutorConfig, UploadExecutor};
use crate::gate::{Gate, GateDecision};
use crate::hook::PostTransferHook;
use crate::notify::result_notification;
use crate::progress::{ProgressReporter, DEFAULT_PROGRESS_INTERVAL};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Milestone cadence in completed items, counted across the whole operation.
    pub milestone_every: usize,
    /// Records per batch as split by the scheduler; used for global indices.
    pub batch_capacity: usize,
    pub progress_interval: Duration,
    pub executor: ExecutorConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            milestone_every: 100,
            batch_capacity: 500,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            executor: ExecutorConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid batch input: {0}")]
    InvalidInput(#[from] InvalidBatch),
    #[error("account {0} cannot be resolved")]
    UnknownAccount(String),
    #[error("no connectivity; batch aborted")]
    NoConnectivity,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BatchError {
    /// Whether the scheduler should run the same batch again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoConnectivity | Self::Store(StoreError::Backend(_))
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    PausedByUser,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub delayed: usize,
    pub conflicts: usize,
    pub duplicates_removed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub milestones: usize,
    pub stop: StopReason,
}

impl BatchSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            processed: 0,
            succeeded: 0,
            failed: 0,
            delayed: 0,
            conflicts: 0,
            duplicates_removed: 0,
            cancelled: 0,
            skipped: 0,
            milestones: 0,
            stop: StopReason::Completed,
        }
    }
}

#[derive(Debug, Clone)]
struct LastProcessed {
    record_id: RecordId,
    remote_path: String,
    status: UploadStatus,
    local_path: PathBuf,
    global_index: usize,
    milestone_sent: bool,
}

/// Drives one batch of records through gate, executor, resolver, store and hook.
///
/// One instance per concurrent batch; progress throttling and the current
/// record live on the instance.
pub struct UploadOrchestrator {
    store: Arc<dyn UploadStore>,
    accounts: Arc<dyn AccountResolver>,
    gate: Gate,
    executor: UploadExecutor,
    resolver: ConflictResolver,
    hook: Option<Arc<dyn PostTransferHook>>,
    events: Arc<dyn EventSink>,
    reporter: ProgressReporter,
    config: OrchestratorConfig,
    cancel: CancellationToken,
    current: Option<UploadRecord>,
    last: Option<LastProcessed>,
}

impl UploadOrchestrator {
    pub fn new(
        store: Arc<dyn UploadStore>,
        transport: Arc<dyn Transport>,
        accounts: Arc<dyn AccountResolver>,
        gate: Gate,
        events: Arc<dyn EventSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            executor: UploadExecutor::new(transport.clone(), config.executor.clone()),
            resolver: ConflictResolver::new(store.clone(), transport),
            reporter: ProgressReporter::new(config.progress_interval),
            store,
            accounts,
            gate,
            hook: None,
            events,
            config,
            cancel: CancellationToken::new(),
            current: None,
            last: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostTransferHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record currently inside the executor, if any.
    pub fn current_upload(&self) -> Option<&UploadRecord> {
        self.current.as_ref()
    }

    pub async fn run(&mut self, input: BatchInput) -> Result<BatchSummary, BatchError> {
        self.run_as(Uuid::now_v7(), input).await
    }

    /// Runs a batch under a caller-chosen run id (the scheduler's ledger key).
    pub async fn run_as(
        &mut self,
        run_id: Uuid,
        input: BatchInput,
    ) -> Result<BatchSummary, BatchError> {
        let batch = input.validate()?;
        let context = self
            .accounts
            .resolve(&batch.account)
            .await
            .ok_or_else(|| BatchError::UnknownAccount(batch.account.clone()))?;

        info!(
            %run_id,
            account = %batch.account,
            records = batch.record_ids.len(),
            batch_index = batch.batch_index,
            total = batch.total_upload_size,
            "upload batch started"
        );
        self.last = None;
        self.events.publish(UploadEvent::BatchStarted {
            run_id,
            account: batch.account.clone(),
        });

        let mut result = self.process(run_id, &batch, &context).await;
        self.current = None;

        if self.publish_final(run_id, &batch) {
            if let Ok(summary) = result.as_mut() {
                summary.milestones += 1;
            }
        }

        match &result {
            Ok(summary) => info!(
                %run_id,
                processed = summary.processed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                stop = ?summary.stop,
                "upload batch finished"
            ),
            Err(err) => warn!(%run_id, error = %err, "upload batch failed"),
        }
        self.events.publish(UploadEvent::BatchFinished {
            run_id,
            account: batch.account.clone(),
            success: result.is_ok(),
            last_local_path: self.last.as_ref().map(|last| last.local_path.clone()),
        });
        result
    }

    async fn process(
        &mut self,
        run_id: Uuid,
        batch: &Batch,
        context: &TransportContext,
    ) -> Result<BatchSummary, BatchError> {
        let records = self
            .store
            .load_records(&batch.record_ids, &batch.account)
            .await?;
        let mut summary = BatchSummary::new(run_id);

        for (local_index, record) in records.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(%run_id, record_id = record.id, "batch cancelled");
                summary.stop = StopReason::Cancelled;
                break;
            }

            let conditions = match self.gate.can_proceed() {
                GateDecision::Proceed(conditions) => conditions,
                GateDecision::PausedByUser => {
                    info!(%run_id, record_id = record.id, "uploads paused by user");
                    self.events.notify(Notification::Paused);
                    summary.stop = StopReason::PausedByUser;
                    break;
                }
                GateDecision::NoConnectivity => {
                    warn!(%run_id, record_id = record.id, "no connectivity; aborting batch");
                    self.events.notify(Notification::ConnectionError);
                    return Err(BatchError::NoConnectivity);
                }
            };

            if record.status.is_terminal() {
                summary.skipped += 1;
                continue;
            }

            // An identical duplicate earlier in the batch drops every record for
            // its remote path, including ones still ahead of us.
            match self.store.mark_in_progress(record.id).await {
                Ok(()) => {}
                Err(StoreError::NotFound { .. }) => {
                    info!(%run_id, record_id = record.id, "record removed during batch; skipping");
                    summary.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            let global_index = global_position(batch, self.config.batch_capacity, local_index);
            self.events.notify(Notification::Started {
                record_id: record.id,
                file_name: record.file_name(),
                current_index: global_index,
                total: batch.total_upload_size,
            });

            self.current = Some(record.clone());
            let outcome = self
                .executor
                .run(
                    context,
                    &record,
                    &conditions,
                    &mut self.reporter,
                    self.events.as_ref(),
                )
                .await;
            self.current = None;

            let Some(status) = self
                .finish_record(context, batch, &record, outcome, &mut summary)
                .await?
            else {
                summary.skipped += 1;
                continue;
            };
            summary.processed += 1;

            let milestone_sent = self.config.milestone_every > 0
                && batch.total_upload_size > self.config.milestone_every
                && global_index % self.config.milestone_every == 0;
            let last = LastProcessed {
                record_id: record.id,
                remote_path: record.remote_path,
                status,
                local_path: record.local_path,
                global_index,
                milestone_sent,
            };
            if milestone_sent {
                self.events
                    .publish(UploadEvent::Milestone(milestone(run_id, batch, &last, false)));
                summary.milestones += 1;
            }
            self.last = Some(last);
        }

        Ok(summary)
    }

    /// Resolves conflicts, persists the outcome and runs success side effects.
    /// `None` means the record vanished from the store before its result landed.
    async fn finish_record(
        &self,
        context: &TransportContext,
        batch: &Batch,
        record: &UploadRecord,
        outcome: TransferOutcome,
        summary: &mut BatchSummary,
    ) -> Result<Option<UploadStatus>, BatchError> {
        if let TransferOutcome::Conflict(details) = &outcome {
            let resolution = self
                .resolver
                .resolve(
                    context,
                    record,
                    details,
                    batch.suppress_same_file_notification,
                    self.events.as_ref(),
                )
                .await?;
            if let Resolution::Duplicate { .. } = resolution {
                summary.duplicates_removed += 1;
                return Ok(Some(UploadStatus::Conflict));
            }
        }

        let status = match self.store.update_result(record, &outcome).await {
            Ok(status) => status,
            Err(StoreError::NotFound { .. }) => {
                warn!(record_id = record.id, "record removed before its result was stored");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        info!(record_id = record.id, %status, "upload result stored");

        match &outcome {
            TransferOutcome::Success(remote) => {
                summary.succeeded += 1;
                apply_local_action(record).await;
                if let (Some(hook), Some(label)) = (&self.hook, &batch.destination_label) {
                    if let Err(err) = hook.after_transfer(context, record, remote, label).await {
                        error!(
                            record_id = record.id,
                            label = %label,
                            error = ?err,
                            "post-transfer hook failed"
                        );
                    }
                }
            }
            TransferOutcome::Conflict(_) => summary.conflicts += 1,
            TransferOutcome::Failure { .. } => summary.failed += 1,
            TransferOutcome::Delayed(_) => summary.delayed += 1,
            TransferOutcome::Cancelled => summary.cancelled += 1,
        }

        if let Some(notification) = result_notification(record, &outcome) {
            self.events.notify(notification);
        }
        Ok(Some(status))
    }

    /// Closing broadcast; skipped when nothing ran or the last record already
    /// produced a milestone.
    fn publish_final(&self, run_id: Uuid, batch: &Batch) -> bool {
        match &self.last {
            Some(last) if !last.milestone_sent => {
                self.events
                    .publish(UploadEvent::Milestone(milestone(run_id, batch, last, true)));
                true
            }
            _ => false,
        }
    }
}

/// 1-based position across the whole operation; saturates instead of wrapping.
fn global_position(batch: &Batch, batch_capacity: usize, local_index: usize) -> usize {
    batch
        .batch_index
        .saturating_mul(batch_capacity)
        .saturating_add(local_index)
        .saturating_add(1)
}

fn milestone(
    run_id: Uuid,
    batch: &Batch,
    last: &LastProcessed,
    is_final: bool,
) -> MilestoneBroadcast {
    MilestoneBroadcast {
        run_id,
        record_id: last.record_id,
        remote_path: last.remote_path.clone(),
        status: last.status,
        old_local_path: last.local_path.clone(),
        completed: last.global_index,
        total: batch.total_upload_size,
        is_final,
    }
}
