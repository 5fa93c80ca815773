use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use upsync_contract::{RemoteFile, UploadRecord};
use upsync_transport::{Transport, TransportContext};

/// Side effect chained after a successful transfer.
///
/// Runs at most once per materialized remote file; a failure is logged by the
/// caller and never changes the record's own outcome.
#[async_trait]
pub trait PostTransferHook: Send + Sync {
    async fn after_transfer(
        &self,
        context: &TransportContext,
        record: &UploadRecord,
        remote: &RemoteFile,
        destination_label: &str,
    ) -> anyhow::Result<()>;
}

/// Places every uploaded file into the collection named by the batch label.
#[derive(Clone)]
pub struct CollectionHook {
    transport: Arc<dyn Transport>,
}

impl CollectionHook {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl PostTransferHook for CollectionHook {
    async fn after_transfer(
        &self,
        context: &TransportContext,
        record: &UploadRecord,
        remote: &RemoteFile,
        destination_label: &str,
    ) -> anyhow::Result<()> {
        self.transport
            .copy_to_collection(context, &remote.remote_path, destination_label)
            .await
            .with_context(|| {
                format!(
                    "failed to add upload {} to collection {destination_label}",
                    record.id
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use upsync_contract::{UploadPolicy, UploadStatus};
    use upsync_transport::ScriptedTransport;

    use super::*;

    fn fixture() -> (TransportContext, UploadRecord, RemoteFile) {
        let context = TransportContext {
            account: "alice".to_string(),
            endpoint: "memory://".to_string(),
        };
        let record = UploadRecord {
            id: 9,
            account: "alice".to_string(),
            local_path: PathBuf::from("/tmp/p.jpg"),
            remote_path: "/Photos/p.jpg".to_string(),
            policy: UploadPolicy::default(),
            status: UploadStatus::Succeeded,
        };
        let remote = RemoteFile {
            // renamed by the server on collision
            remote_path: "/Photos/p (2).jpg".to_string(),
            etag: None,
            size: 3,
        };
        (context, record, remote)
    }

    #[tokio::test]
    async fn copies_the_materialized_remote_path() {
        let transport = Arc::new(ScriptedTransport::new());
        let hook = CollectionHook::new(transport.clone());
        let (context, record, remote) = fixture();

        hook.after_transfer(&context, &record, &remote, "Holiday")
            .await
            .expect("hook");

        assert_eq!(
            transport.collections().await,
            vec![("/Photos/p (2).jpg".to_string(), "Holiday".to_string())]
        );
    }

    #[tokio::test]
    async fn transport_refusal_surfaces_with_context() {
        let hook = CollectionHook::new(Arc::new(ScriptedTransport::new().with_failing_collections()));
        let (context, record, remote) = fixture();

        let err = hook
            .after_transfer(&context, &record, &remote, "Holiday")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("collection Holiday"));
    }
}
