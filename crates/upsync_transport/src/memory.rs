use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;
use upsync_contract::{ConflictDetails, ProgressSample, RemoteFile, UploadRecord};

use crate::transport::{
    AccountResolver, ProgressListener, Transport, TransportContext, TransportError,
};

/// Canned response for one remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResult {
    Success,
    Conflict { identical: bool },
    LockFailed,
    Unauthorized,
    Rejected { status: u16 },
    Unreachable,
    Cancelled,
}

/// Deterministic transport: every upload answers from a per-path script and
/// emits a fixed ladder of progress samples first.
#[derive(Debug)]
pub struct ScriptedTransport {
    scripts: HashMap<String, ScriptedResult>,
    progress_total: u64,
    progress_step: u64,
    sample_spacing: Duration,
    failing_collections: bool,
    state: Mutex<ScriptedState>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    attempted: Vec<String>,
    identical_remote: HashSet<String>,
    collections: Vec<(String, String)>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            progress_total: 0,
            progress_step: 0,
            sample_spacing: Duration::ZERO,
            failing_collections: false,
            state: Mutex::new(ScriptedState::default()),
        }
    }

    pub fn with_result(mut self, remote_path: &str, result: ScriptedResult) -> Self {
        self.scripts.insert(remote_path.to_string(), result);
        self
    }

    /// Emits `total / step` samples per upload, timestamped `spacing` apart.
    pub fn with_progress(mut self, total: u64, step: u64, spacing: Duration) -> Self {
        self.progress_total = total;
        self.progress_step = step;
        self.sample_spacing = spacing;
        self
    }

    pub fn with_failing_collections(mut self) -> Self {
        self.failing_collections = true;
        self
    }

    /// Remote paths passed to `upload`, in call order.
    pub async fn attempted(&self) -> Vec<String> {
        self.state.lock().await.attempted.clone()
    }

    pub async fn collections(&self) -> Vec<(String, String)> {
        self.state.lock().await.collections.clone()
    }

    fn emit_progress(&self, progress: &ProgressListener, file_name: &str) {
        if self.progress_step == 0 {
            return;
        }
        let started = Instant::now();
        let mut sent = 0;
        let mut tick: u32 = 0;
        while sent < self.progress_total {
            sent = (sent + self.progress_step).min(self.progress_total);
            progress.report_sample(ProgressSample {
                bytes_transferred: sent,
                bytes_total: self.progress_total,
                file_name: file_name.to_string(),
                at: started + self.sample_spacing * tick,
            });
            tick += 1;
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn upload(
        &self,
        context: &TransportContext,
        record: &UploadRecord,
        progress: ProgressListener,
    ) -> Result<RemoteFile, TransportError> {
        let script = self
            .scripts
            .get(&record.remote_path)
            .cloned()
            .unwrap_or(ScriptedResult::Success);
        info!(
            account = %context.account,
            remote_path = %record.remote_path,
            script = ?script,
            "scripted upload"
        );

        {
            let mut state = self.state.lock().await;
            state.attempted.push(record.remote_path.clone());
            if script == (ScriptedResult::Conflict { identical: true }) {
                state.identical_remote.insert(record.remote_path.clone());
            }
        }

        self.emit_progress(&progress, &record.file_name());

        match script {
            ScriptedResult::Success => Ok(RemoteFile {
                remote_path: record.remote_path.clone(),
                etag: Some(format!("etag-{}", record.id)),
                size: self.progress_total,
            }),
            ScriptedResult::Conflict { .. } => Err(TransportError::Conflict(ConflictDetails {
                remote_path: record.remote_path.clone(),
                expected_etag: None,
                remote_etag: Some("remote-etag".to_string()),
            })),
            ScriptedResult::LockFailed => Err(TransportError::LockFailed),
            ScriptedResult::Unauthorized => Err(TransportError::Unauthorized),
            ScriptedResult::Rejected { status } => Err(TransportError::Rejected {
                status,
                message: "scripted rejection".to_string(),
            }),
            ScriptedResult::Unreachable => {
                Err(TransportError::Unreachable("scripted outage".to_string()))
            }
            ScriptedResult::Cancelled => Err(TransportError::Cancelled),
        }
    }

    async fn is_same_file_on_remote(
        &self,
        _context: &TransportContext,
        _local_path: &Path,
        remote_path: &str,
    ) -> Result<bool, TransportError> {
        Ok(self.state.lock().await.identical_remote.contains(remote_path))
    }

    async fn copy_to_collection(
        &self,
        _context: &TransportContext,
        remote_path: &str,
        collection: &str,
    ) -> Result<(), TransportError> {
        if self.failing_collections {
            return Err(TransportError::Rejected {
                status: 409,
                message: format!("collection {collection} refused {remote_path}"),
            });
        }
        self.state
            .lock()
            .await
            .collections
            .push((remote_path.to_string(), collection.to_string()));
        Ok(())
    }
}

/// Fixed account table; every known account maps to the same endpoint.
#[derive(Debug, Clone, Default)]
pub struct StaticAccounts {
    contexts: HashMap<String, TransportContext>,
}

impl StaticAccounts {
    pub fn new<I, S>(accounts: I, endpoint: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let contexts = accounts
            .into_iter()
            .map(|account| {
                let account: String = account.into();
                let context = TransportContext {
                    account: account.clone(),
                    endpoint: endpoint.to_string(),
                };
                (account, context)
            })
            .collect();
        Self { contexts }
    }
}

#[async_trait]
impl AccountResolver for StaticAccounts {
    async fn resolve(&self, account: &str) -> Option<TransportContext> {
        self.contexts.get(account).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::progress_channel;
    use std::path::PathBuf;
    use upsync_contract::{UploadPolicy, UploadStatus};

    fn record(remote_path: &str) -> UploadRecord {
        UploadRecord {
            id: 7,
            account: "alice".to_string(),
            local_path: PathBuf::from("/tmp/x"),
            remote_path: remote_path.to_string(),
            policy: UploadPolicy::default(),
            status: UploadStatus::Queued,
        }
    }

    fn context() -> TransportContext {
        TransportContext {
            account: "alice".to_string(),
            endpoint: "memory://".to_string(),
        }
    }

    #[tokio::test]
    async fn identical_conflict_is_visible_to_same_file_check() {
        let transport = ScriptedTransport::new()
            .with_result("/dup.jpg", ScriptedResult::Conflict { identical: true });
        let (listener, _samples) = progress_channel();

        let err = transport
            .upload(&context(), &record("/dup.jpg"), listener)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Conflict(_)));
        assert!(transport
            .is_same_file_on_remote(&context(), Path::new("/tmp/x"), "/dup.jpg")
            .await
            .expect("check"));
    }

    #[tokio::test]
    async fn progress_ladder_reaches_total() {
        let transport = ScriptedTransport::new().with_progress(100, 25, Duration::from_millis(10));
        let (listener, mut samples) = progress_channel();

        transport
            .upload(&context(), &record("/a.bin"), listener)
            .await
            .expect("upload");

        let mut last = None;
        let mut count = 0;
        while let Some(sample) = samples.recv().await {
            count += 1;
            last = Some(sample.percent());
        }
        assert_eq!(count, 4);
        assert_eq!(last, Some(100));
    }

    #[tokio::test]
    async fn unknown_account_does_not_resolve() {
        let accounts = StaticAccounts::new(["alice"], "https://cloud.example");
        assert!(accounts.resolve("alice").await.is_some());
        assert!(accounts.resolve("bob").await.is_none());
    }
}
