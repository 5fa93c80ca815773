use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};
use upsync_contract::{RecordId, TransferOutcome, UploadPolicy, UploadRecord, UploadStatus};

use crate::store::{StoreError, UploadStore};

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

const UPLOAD_COLUMNS: &str = "upload_id, account_name, local_path, remote_path, policy_json, status, status_detail, failure_reason, created_at, updated_at";

const OPEN_STATES: &str = "('queued', 'in_progress', 'delayed')";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct UpsyncStorage {
    pool: SqlitePool,
}

/// Request to add one record to the upload table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUpload {
    pub account: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    #[serde(default)]
    pub policy: UploadPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UploadRow {
    pub upload_id: i64,
    pub account_name: String,
    pub local_path: String,
    pub remote_path: String,
    pub policy_json: String,
    pub status: String,
    pub status_detail: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl UploadRow {
    pub fn into_record(self) -> Result<UploadRecord> {
        let policy: UploadPolicy = serde_json::from_str(&self.policy_json)
            .with_context(|| format!("parse policy of upload {}", self.upload_id))?;
        let status = UploadStatus::from_parts(&self.status, self.status_detail.as_deref())
            .with_context(|| format!("parse status of upload {}", self.upload_id))?;

        Ok(UploadRecord {
            id: self.upload_id,
            account: self.account_name,
            local_path: PathBuf::from(self.local_path),
            remote_path: self.remote_path,
            policy,
            status,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    RetryPending,
}

impl BatchRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RetryPending => "retry_pending",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BatchRunRecord {
    pub run_id: String,
    pub account_name: String,
    #[serde(skip)]
    pub input_msgpack: Vec<u8>,
    pub status: String,
    pub attempts: i64,
    pub failure_reason: Option<String>,
    pub submitted_at: String,
    pub updated_at: String,
}

impl UpsyncStorage {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let uri = normalize_sqlite_uri(&config.sqlite_path);
        let options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {}", uri))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }
        info!("upsync sqlite schema ready");
        Ok(())
    }

    pub async fn enqueue(&self, upload: &NewUpload) -> Result<UploadRecord> {
        let now = Utc::now().to_rfc3339();
        let policy_json =
            serde_json::to_string(&upload.policy).context("serialize upload policy")?;

        let result = sqlx::query(
            "INSERT INTO uploads(account_name, local_path, remote_path, policy_json, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&upload.account)
        .bind(upload.local_path.to_string_lossy().into_owned())
        .bind(&upload.remote_path)
        .bind(&policy_json)
        .bind(UploadStatus::Queued.kind())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("insert upload")?;

        self.get_upload(result.last_insert_rowid())
            .await?
            .context("upload missing after insert")
    }

    pub async fn get_upload(&self, id: RecordId) -> Result<Option<UploadRecord>> {
        let sql = format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE upload_id = ?");
        sqlx::query_as::<_, UploadRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("query upload {id}"))?
            .map(UploadRow::into_record)
            .transpose()
    }

    pub async fn list_uploads(
        &self,
        account: Option<&str>,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<UploadRecord>> {
        let sql = format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE (?1 IS NULL OR account_name = ?1) AND (?2 IS NULL OR status = ?2) ORDER BY upload_id ASC LIMIT ?3"
        );
        let rows = sqlx::query_as::<_, UploadRow>(&sql)
            .bind(account)
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("query uploads")?;

        rows.into_iter().map(UploadRow::into_record).collect()
    }

    /// Reopens a finished or delayed record for a future batch. In-flight records are left alone.
    pub async fn requeue(&self, id: RecordId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE uploads SET status = 'queued', status_detail = NULL, failure_reason = NULL, updated_at = ? WHERE upload_id = ? AND status != 'in_progress'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("requeue upload {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn purge_finished(&self, retention_days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();

        let uploads = sqlx::query("DELETE FROM uploads WHERE status = 'succeeded' AND updated_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await
            .context("purge succeeded uploads")?;

        sqlx::query("DELETE FROM batch_runs WHERE status IN ('succeeded', 'failed') AND updated_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await
            .context("purge finished batch runs")?;

        Ok(uploads.rows_affected())
    }

    pub async fn create_batch_run(
        &self,
        run_id: &str,
        account: &str,
        input_msgpack: &[u8],
    ) -> Result<BatchRunRecord> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO batch_runs(run_id, account_name, input_msgpack, status, submitted_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(account)
        .bind(input_msgpack)
        .bind(BatchRunStatus::Queued.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("insert batch run")?;

        self.get_batch_run(run_id)
            .await?
            .context("batch run missing after insert")
    }

    pub async fn start_batch_run(&self, run_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE batch_runs SET status = ?, attempts = attempts + 1, failure_reason = NULL, updated_at = ? WHERE run_id = ?",
        )
        .bind(BatchRunStatus::Running.as_str())
        .bind(now)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("start batch run {run_id}"))?;
        Ok(())
    }

    pub async fn finish_batch_run(
        &self,
        run_id: &str,
        status: BatchRunStatus,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE batch_runs SET status = ?, failure_reason = ?, updated_at = ? WHERE run_id = ?")
            .bind(status.as_str())
            .bind(failure_reason)
            .bind(now)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("finish batch run {run_id}"))?;
        Ok(())
    }

    pub async fn get_batch_run(&self, run_id: &str) -> Result<Option<BatchRunRecord>> {
        sqlx::query_as::<_, BatchRunRecord>(
            "SELECT run_id, account_name, input_msgpack, status, attempts, failure_reason, submitted_at, updated_at FROM batch_runs WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query batch run {run_id}"))
    }

    async fn transition(
        &self,
        id: RecordId,
        next: UploadStatus,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE uploads SET status = ?, status_detail = ?, failure_reason = ?, updated_at = ? WHERE upload_id = ? AND status IN {OPEN_STATES}"
        );
        let result = sqlx::query(&sql)
            .bind(next.kind())
            .bind(next.detail())
            .bind(failure_reason)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("update upload {id}"))?;

        if result.rows_affected() > 0 {
            debug!(record_id = id, status = %next, "upload status persisted");
            return Ok(());
        }

        match self.get_upload(id).await? {
            Some(current) => Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to: next,
            }),
            None => Err(StoreError::NotFound { ids: vec![id] }),
        }
    }
}

#[async_trait]
impl UploadStore for UpsyncStorage {
    async fn load_records(
        &self,
        ids: &[RecordId],
        account: &str,
    ) -> Result<Vec<UploadRecord>, StoreError> {
        let sql = format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE upload_id = ? AND account_name = ?");
        let mut records = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();

        for id in ids {
            let row = sqlx::query_as::<_, UploadRow>(&sql)
                .bind(id)
                .bind(account)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("query upload {id} for {account}"))?;
            match row {
                Some(row) => records.push(row.into_record()?),
                None => missing.push(*id),
            }
        }

        if !missing.is_empty() {
            return Err(StoreError::NotFound { ids: missing });
        }
        Ok(records)
    }

    async fn mark_in_progress(&self, id: RecordId) -> Result<(), StoreError> {
        self.transition(id, UploadStatus::InProgress, None).await
    }

    async fn update_result(
        &self,
        record: &UploadRecord,
        outcome: &TransferOutcome,
    ) -> Result<UploadStatus, StoreError> {
        let status = outcome.status();
        self.transition(record.id, status, outcome.failure_message())
            .await?;
        Ok(status)
    }

    async fn remove_record(&self, account: &str, remote_path: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM uploads WHERE account_name = ? AND remote_path = ?")
            .bind(account)
            .bind(remote_path)
            .execute(&self.pool)
            .await
            .with_context(|| format!("remove upload {remote_path} for {account}"))?;
        Ok(result.rows_affected())
    }
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
