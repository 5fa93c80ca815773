use std::io;
use std::sync::Arc;

use tracing::{info, warn};
use upsync_contract::{ConflictDetails, LocalAction, Notification, UploadRecord};
use upsync_storage::{StoreError, UploadStore};
use upsync_transport::{Transport, TransportContext};

use crate::events::EventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Remote already holds these bytes; the record was dropped from the store.
    Duplicate { removed: u64 },
    /// Remote diverged; the record is to be persisted as a conflict.
    Divergent { notified: bool },
}

/// Splits conflicts into harmless re-submissions and genuine divergent edits.
#[derive(Clone)]
pub struct ConflictResolver {
    store: Arc<dyn UploadStore>,
    transport: Arc<dyn Transport>,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn UploadStore>, transport: Arc<dyn Transport>) -> Self {
        Self { store, transport }
    }

    pub async fn resolve(
        &self,
        context: &TransportContext,
        record: &UploadRecord,
        details: &ConflictDetails,
        suppress_notification: bool,
        events: &dyn EventSink,
    ) -> Result<Resolution, StoreError> {
        let identical = match self
            .transport
            .is_same_file_on_remote(context, &record.local_path, &details.remote_path)
            .await
        {
            Ok(identical) => identical,
            Err(err) => {
                warn!(
                    record_id = record.id,
                    error = %err,
                    "same-file check failed; treating conflict as divergent"
                );
                false
            }
        };

        if identical {
            let removed = self
                .store
                .remove_record(&record.account, &record.remote_path)
                .await?;
            apply_local_action(record).await;
            info!(
                record_id = record.id,
                remote_path = %record.remote_path,
                removed,
                "duplicate upload dropped"
            );
            return Ok(Resolution::Duplicate { removed });
        }

        let notified = !suppress_notification;
        if notified {
            events.notify(Notification::Conflict {
                record_id: record.id,
                file_name: record.file_name(),
                remote_path: details.remote_path.clone(),
            });
        }
        info!(
            record_id = record.id,
            remote_path = %details.remote_path,
            notified,
            "divergent remote content"
        );
        Ok(Resolution::Divergent { notified })
    }
}

/// Applies the record's post-transfer action to the local source.
/// Failures are logged; the remote copy already exists either way.
pub async fn apply_local_action(record: &UploadRecord) {
    match record.policy.local_action {
        LocalAction::None | LocalAction::KeepLocal => {}
        LocalAction::DeleteLocal => match tokio::fs::remove_file(&record.local_path).await {
            Ok(()) => info!(record_id = record.id, "local source removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                record_id = record.id,
                path = %record.local_path.display(),
                error = %err,
                "failed to remove local source"
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use upsync_contract::{RecordId, TransferOutcome, UploadEvent, UploadPolicy, UploadStatus};
    use upsync_storage::{InMemoryUploadStore, NewUpload};
    use upsync_transport::{progress_channel, ScriptedResult, ScriptedTransport};

    use super::*;

    fn context() -> TransportContext {
        TransportContext {
            account: "alice".to_string(),
            endpoint: "memory://".to_string(),
        }
    }

    async fn setup(
        script: ScriptedResult,
        local_action: LocalAction,
        local_path: PathBuf,
    ) -> (ConflictResolver, Arc<InMemoryUploadStore>, UploadRecord, ConflictDetails) {
        let store = Arc::new(InMemoryUploadStore::new());
        let transport = Arc::new(ScriptedTransport::new().with_result("/Photos/a.jpg", script));
        let record = store
            .enqueue(NewUpload {
                account: "alice".to_string(),
                local_path,
                remote_path: "/Photos/a.jpg".to_string(),
                policy: UploadPolicy {
                    local_action,
                    ..UploadPolicy::default()
                },
            })
            .await;

        let (listener, _samples) = progress_channel();
        let details = match transport.upload(&context(), &record, listener).await {
            Err(upsync_transport::TransportError::Conflict(details)) => details,
            other => panic!("expected conflict, got {other:?}"),
        };
        (
            ConflictResolver::new(store.clone(), transport),
            store,
            record,
            details,
        )
    }

    #[tokio::test]
    async fn identical_remote_removes_record_and_applies_local_action() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = dir.path().join("a.jpg");
        std::fs::write(&local, b"same").expect("write");
        let (resolver, store, record, details) = setup(
            ScriptedResult::Conflict { identical: true },
            LocalAction::DeleteLocal,
            local.clone(),
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel::<UploadEvent>();

        let resolution = resolver
            .resolve(&context(), &record, &details, false, &tx)
            .await
            .expect("resolve");

        assert_eq!(resolution, Resolution::Duplicate { removed: 1 });
        assert!(store.get(record.id).await.is_none());
        assert!(!local.exists());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn divergent_remote_notifies_once_and_keeps_local() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = dir.path().join("a.jpg");
        std::fs::write(&local, b"mine").expect("write");
        let (resolver, store, record, details) = setup(
            ScriptedResult::Conflict { identical: false },
            LocalAction::DeleteLocal,
            local.clone(),
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel::<UploadEvent>();

        let resolution = resolver
            .resolve(&context(), &record, &details, false, &tx)
            .await
            .expect("resolve");

        assert_eq!(resolution, Resolution::Divergent { notified: true });
        assert!(store.get(record.id).await.is_some());
        assert!(local.exists());
        assert!(matches!(
            rx.try_recv(),
            Ok(UploadEvent::Notification(Notification::Conflict { .. }))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn divergent_notification_can_be_suppressed() {
        let (resolver, _store, record, details) = setup(
            ScriptedResult::Conflict { identical: false },
            LocalAction::None,
            PathBuf::from("/nonexistent/a.jpg"),
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel::<UploadEvent>();

        let resolution = resolver
            .resolve(&context(), &record, &details, true, &tx)
            .await
            .expect("resolve");

        assert_eq!(resolution, Resolution::Divergent { notified: false });
        assert!(rx.try_recv().is_err());
    }

    /// Store whose removals always fail.
    struct RemovalFails(Arc<InMemoryUploadStore>);

    #[async_trait]
    impl UploadStore for RemovalFails {
        async fn load_records(
            &self,
            ids: &[RecordId],
            account: &str,
        ) -> Result<Vec<UploadRecord>, StoreError> {
            self.0.load_records(ids, account).await
        }

        async fn mark_in_progress(&self, id: RecordId) -> Result<(), StoreError> {
            self.0.mark_in_progress(id).await
        }

        async fn update_result(
            &self,
            record: &UploadRecord,
            outcome: &TransferOutcome,
        ) -> Result<UploadStatus, StoreError> {
            self.0.update_result(record, outcome).await
        }

        async fn remove_record(&self, _account: &str, _remote_path: &str) -> Result<u64, StoreError> {
            Err(StoreError::Backend(anyhow::anyhow!("disk full")))
        }
    }

    #[tokio::test]
    async fn failed_removal_keeps_local_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = dir.path().join("a.jpg");
        std::fs::write(&local, b"same").expect("write");
        let store = Arc::new(InMemoryUploadStore::new());
        let transport = Arc::new(
            ScriptedTransport::new()
                .with_result("/Photos/a.jpg", ScriptedResult::Conflict { identical: true }),
        );
        let record = store
            .enqueue(NewUpload {
                account: "alice".to_string(),
                local_path: local.clone(),
                remote_path: "/Photos/a.jpg".to_string(),
                policy: UploadPolicy {
                    local_action: LocalAction::DeleteLocal,
                    ..UploadPolicy::default()
                },
            })
            .await;
        let (listener, _samples) = progress_channel();
        let details = match transport.upload(&context(), &record, listener).await {
            Err(upsync_transport::TransportError::Conflict(details)) => details,
            other => panic!("expected conflict, got {other:?}"),
        };
        let resolver = ConflictResolver::new(Arc::new(RemovalFails(store.clone())), transport);
        let (tx, _rx) = mpsc::unbounded_channel::<UploadEvent>();

        let err = resolver
            .resolve(&context(), &record, &details, false, &tx)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Backend(_)));
        assert!(local.exists());
        assert!(store.get(record.id).await.is_some());
    }
}
