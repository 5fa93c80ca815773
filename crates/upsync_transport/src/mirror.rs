use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use upsync_contract::{ConflictDetails, NameCollisionPolicy, RemoteFile, UploadRecord};

use crate::transport::{ProgressListener, Transport, TransportContext, TransportError};

const CHUNK_SIZE: usize = 64 * 1024;
const COLLECTIONS_DIR: &str = ".collections";

/// Transport whose "remote" is a directory tree: `<root>/<account>/<remote path>`.
#[derive(Debug, Clone)]
pub struct MirrorTransport {
    root: PathBuf,
}

impl MirrorTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn account_root(&self, context: &TransportContext) -> PathBuf {
        self.root.join(&context.account)
    }

    fn resolve(&self, context: &TransportContext, remote_path: &str) -> Result<PathBuf, TransportError> {
        let relative = Path::new(remote_path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if escapes || relative.as_os_str().is_empty() {
            return Err(TransportError::Rejected {
                status: 400,
                message: format!("invalid remote path {remote_path}"),
            });
        }
        Ok(self.account_root(context).join(relative))
    }

    async fn stream_into(
        &self,
        source: &mut File,
        target: &Path,
        total: u64,
        file_name: &str,
        progress: &ProgressListener,
    ) -> Result<u64, TransportError> {
        let partial = target.with_extension(match target.extension() {
            Some(ext) => format!("{}.part", ext.to_string_lossy()),
            None => "part".to_string(),
        });
        let copied = async {
            let mut sink = File::create(&partial).await?;
            let mut buffer = vec![0u8; CHUNK_SIZE];
            let mut transferred = 0u64;

            loop {
                let read = source.read(&mut buffer).await?;
                if read == 0 {
                    break;
                }
                sink.write_all(&buffer[..read]).await?;
                transferred += read as u64;
                progress.report(transferred, total, file_name);
            }
            sink.flush().await?;
            sink.sync_all().await?;
            drop(sink);

            fs::rename(&partial, target).await?;
            Ok::<u64, std::io::Error>(transferred)
        }
        .await;

        match copied {
            Ok(transferred) => Ok(transferred),
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&partial).await {
                    if cleanup.kind() != ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %cleanup, "failed to remove partial upload");
                    }
                }
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl Transport for MirrorTransport {
    async fn upload(
        &self,
        context: &TransportContext,
        record: &UploadRecord,
        progress: ProgressListener,
    ) -> Result<RemoteFile, TransportError> {
        let mut source = match File::open(&record.local_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(TransportError::LocalFileNotFound(record.local_path.clone()))
            }
            Err(err) => return Err(err.into()),
        };
        let total = source.metadata().await?.len();

        let mut remote_path = record.remote_path.clone();
        let mut target = self.resolve(context, &remote_path)?;
        if let Ok(existing) = fs::metadata(&target).await {
            match record.policy.name_collision {
                NameCollisionPolicy::Replace => {
                    debug!(remote_path = %remote_path, "replacing existing remote file");
                }
                NameCollisionPolicy::Rename => {
                    target = next_free_name(&target).await;
                    remote_path = rename_remote(&remote_path, &target);
                }
                NameCollisionPolicy::Cancel | NameCollisionPolicy::AskUser => {
                    return Err(TransportError::Conflict(ConflictDetails {
                        remote_path,
                        expected_etag: None,
                        remote_etag: Some(etag_of(&existing)),
                    }));
                }
            }
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let size = self
            .stream_into(&mut source, &target, total, &record.file_name(), &progress)
            .await?;
        let etag = fs::metadata(&target).await.ok().map(|meta| etag_of(&meta));

        info!(
            account = %context.account,
            remote_path = %remote_path,
            bytes = size,
            "mirrored upload complete"
        );
        Ok(RemoteFile {
            remote_path,
            etag,
            size,
        })
    }

    async fn is_same_file_on_remote(
        &self,
        context: &TransportContext,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<bool, TransportError> {
        let local = match fs::read(local_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(TransportError::LocalFileNotFound(local_path.to_path_buf()))
            }
            Err(err) => return Err(err.into()),
        };
        let target = self.resolve(context, remote_path)?;
        match fs::metadata(&target).await {
            Ok(meta) if meta.len() != local.len() as u64 => return Ok(false),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        Ok(fs::read(&target).await? == local)
    }

    async fn copy_to_collection(
        &self,
        context: &TransportContext,
        remote_path: &str,
        collection: &str,
    ) -> Result<(), TransportError> {
        let source = self.resolve(context, remote_path)?;
        let file_name = source.file_name().ok_or_else(|| TransportError::Rejected {
            status: 400,
            message: format!("remote path {remote_path} has no file name"),
        })?;
        let collection_dir = self.resolve(context, &format!("{COLLECTIONS_DIR}/{collection}"))?;

        if fs::metadata(&source).await.is_err() {
            return Err(TransportError::Rejected {
                status: 404,
                message: format!("remote file {remote_path} does not exist"),
            });
        }
        fs::create_dir_all(&collection_dir).await?;
        fs::copy(&source, collection_dir.join(file_name)).await?;
        Ok(())
    }
}

fn etag_of(meta: &std::fs::Metadata) -> String {
    let modified = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("{:x}-{:x}", meta.len(), modified)
}

/// `photo.jpg` -> `photo (2).jpg`, `photo (3).jpg`, ... whichever is free first.
async fn next_free_name(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = target
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 2u32;
    loop {
        let candidate = target.with_file_name(format!("{stem} ({counter}){extension}"));
        if fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
        counter += 1;
    }
}

fn rename_remote(remote_path: &str, target: &Path) -> String {
    let new_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    match remote_path.rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/{new_name}"),
        None => new_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::progress_channel;
    use upsync_contract::{UploadPolicy, UploadStatus};

    fn context() -> TransportContext {
        TransportContext {
            account: "alice".to_string(),
            endpoint: "file://mirror".to_string(),
        }
    }

    fn record(local: &Path, remote_path: &str, collision: NameCollisionPolicy) -> UploadRecord {
        UploadRecord {
            id: 1,
            account: "alice".to_string(),
            local_path: local.to_path_buf(),
            remote_path: remote_path.to_string(),
            policy: UploadPolicy {
                name_collision: collision,
                ..UploadPolicy::default()
            },
            status: UploadStatus::Queued,
        }
    }

    #[tokio::test]
    async fn upload_copies_bytes_and_reports_final_progress() {
        let local_dir = tempfile::tempdir().expect("tempdir");
        let remote_dir = tempfile::tempdir().expect("tempdir");
        let local = local_dir.path().join("notes.txt");
        std::fs::write(&local, vec![7u8; CHUNK_SIZE + 10]).expect("write");

        let transport = MirrorTransport::new(remote_dir.path());
        let (listener, mut samples) = progress_channel();
        let remote = transport
            .upload(&context(), &record(&local, "/Docs/notes.txt", NameCollisionPolicy::Rename), listener)
            .await
            .expect("upload");

        assert_eq!(remote.remote_path, "/Docs/notes.txt");
        assert_eq!(remote.size, (CHUNK_SIZE + 10) as u64);
        let copied = std::fs::read(remote_dir.path().join("alice/Docs/notes.txt")).expect("read");
        assert_eq!(copied.len(), CHUNK_SIZE + 10);

        let mut last = 0;
        while let Some(sample) = samples.recv().await {
            last = sample.percent();
        }
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn rename_policy_keeps_both_files() {
        let local_dir = tempfile::tempdir().expect("tempdir");
        let remote_dir = tempfile::tempdir().expect("tempdir");
        let local = local_dir.path().join("a.jpg");
        std::fs::write(&local, b"new").expect("write");
        std::fs::create_dir_all(remote_dir.path().join("alice/Photos")).expect("mkdir");
        std::fs::write(remote_dir.path().join("alice/Photos/a.jpg"), b"old").expect("write");

        let transport = MirrorTransport::new(remote_dir.path());
        let (listener, _samples) = progress_channel();
        let remote = transport
            .upload(&context(), &record(&local, "/Photos/a.jpg", NameCollisionPolicy::Rename), listener)
            .await
            .expect("upload");

        assert_eq!(remote.remote_path, "/Photos/a (2).jpg");
        assert_eq!(
            std::fs::read(remote_dir.path().join("alice/Photos/a.jpg")).expect("read"),
            b"old"
        );
    }

    #[tokio::test]
    async fn cancel_policy_reports_conflict_and_same_file_check_compares_bytes() {
        let local_dir = tempfile::tempdir().expect("tempdir");
        let remote_dir = tempfile::tempdir().expect("tempdir");
        let local = local_dir.path().join("a.jpg");
        std::fs::write(&local, b"same").expect("write");
        std::fs::create_dir_all(remote_dir.path().join("alice")).expect("mkdir");
        std::fs::write(remote_dir.path().join("alice/a.jpg"), b"same").expect("write");

        let transport = MirrorTransport::new(remote_dir.path());
        let (listener, _samples) = progress_channel();
        let err = transport
            .upload(&context(), &record(&local, "/a.jpg", NameCollisionPolicy::Cancel), listener)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Conflict(_)));

        assert!(transport
            .is_same_file_on_remote(&context(), &local, "/a.jpg")
            .await
            .expect("compare"));
        std::fs::write(&local, b"diff").expect("write");
        assert!(!transport
            .is_same_file_on_remote(&context(), &local, "/a.jpg")
            .await
            .expect("compare"));
    }

    #[tokio::test]
    async fn missing_local_file_and_escaping_paths_are_rejected() {
        let remote_dir = tempfile::tempdir().expect("tempdir");
        let transport = MirrorTransport::new(remote_dir.path());

        let (listener, _samples) = progress_channel();
        let err = transport
            .upload(
                &context(),
                &record(Path::new("/nonexistent/a.jpg"), "/a.jpg", NameCollisionPolicy::Rename),
                listener,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::LocalFileNotFound(_)));

        let err = transport.resolve(&context(), "/../escape.txt").unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 400, .. }));
    }

    #[tokio::test]
    async fn collection_copy_lands_under_collections_dir() {
        let remote_dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(remote_dir.path().join("alice/Photos")).expect("mkdir");
        std::fs::write(remote_dir.path().join("alice/Photos/a.jpg"), b"img").expect("write");

        let transport = MirrorTransport::new(remote_dir.path());
        transport
            .copy_to_collection(&context(), "/Photos/a.jpg", "Holidays")
            .await
            .expect("copy");
        assert!(remote_dir.path().join("alice/.collections/Holidays/a.jpg").exists());

        let err = transport
            .copy_to_collection(&context(), "/Photos/missing.jpg", "Holidays")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 404, .. }));
    }

    #[tokio::test]
    async fn failed_copy_leaves_no_partial_file() {
        let local_dir = tempfile::tempdir().expect("tempdir");
        let remote_dir = tempfile::tempdir().expect("tempdir");
        // Reading a directory handle fails with EISDIR on the first chunk.
        let mut source = File::open(local_dir.path()).await.expect("open dir");
        let target = remote_dir.path().join("out.bin");

        let transport = MirrorTransport::new(remote_dir.path());
        let (listener, _samples) = progress_channel();
        let err = transport
            .stream_into(&mut source, &target, 10, "out.bin", &listener)
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Io(_)));
        assert!(!target.exists());
        assert!(!remote_dir.path().join("out.bin.part").exists());
    }
}

