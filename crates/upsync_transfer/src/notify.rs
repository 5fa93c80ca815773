use upsync_contract::{Notification, ResultCode, TransferOutcome, UploadRecord};

/// User notification warranted by a finished attempt, if any.
///
/// Only actionable failures surface; a missing source or a held lock clears
/// itself or is not something the user can fix. Conflicts are reported by the
/// conflict resolver, everything else is silent.
pub fn result_notification(record: &UploadRecord, outcome: &TransferOutcome) -> Option<Notification> {
    match outcome {
        TransferOutcome::Failure { code, message } if code.is_actionable() => {
            Some(Notification::Failed {
                record_id: record.id,
                file_name: record.file_name(),
                code: *code,
                message: message.clone(),
                needs_credentials: *code == ResultCode::Unauthorized,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use upsync_contract::{DelayReason, RemoteFile, UploadPolicy, UploadStatus};

    use super::*;

    fn record() -> UploadRecord {
        UploadRecord {
            id: 4,
            account: "alice".to_string(),
            local_path: PathBuf::from("/tmp/clip.mov"),
            remote_path: "/Camera/clip.mov".to_string(),
            policy: UploadPolicy::default(),
            status: UploadStatus::InProgress,
        }
    }

    #[test]
    fn unauthorized_asks_for_credentials() {
        let outcome = TransferOutcome::failure(ResultCode::Unauthorized, "401");
        match result_notification(&record(), &outcome) {
            Some(Notification::Failed {
                code,
                needs_credentials,
                file_name,
                ..
            }) => {
                assert_eq!(code, ResultCode::Unauthorized);
                assert!(needs_credentials);
                assert_eq!(file_name, "clip.mov");
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[test]
    fn server_error_notifies_without_credentials() {
        let outcome = TransferOutcome::failure(ResultCode::ServerError, "500");
        assert!(matches!(
            result_notification(&record(), &outcome),
            Some(Notification::Failed {
                needs_credentials: false,
                ..
            })
        ));
    }

    #[test]
    fn non_actionable_and_non_failures_are_silent() {
        let silent = [
            TransferOutcome::failure(ResultCode::LockFailed, "locked"),
            TransferOutcome::failure(ResultCode::LocalFileNotFound, "gone"),
            TransferOutcome::Delayed(DelayReason::Wifi),
            TransferOutcome::Cancelled,
            TransferOutcome::Success(RemoteFile {
                remote_path: "/Camera/clip.mov".to_string(),
                etag: None,
                size: 1,
            }),
        ];
        for outcome in silent {
            assert_eq!(result_notification(&record(), &outcome), None, "{outcome:?}");
        }
    }
}
