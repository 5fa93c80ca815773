use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use upsync_contract::{BatchInput, UploadEvent};
use upsync_storage::{BatchRunStatus, NewUpload, UpsyncStorage};
use upsync_transfer::{
    CollectionHook, ConditionsProvider, DeviceConditions, Gate, OrchestratorConfig, PauseSwitch,
    StaticConditions, StopReason, UploadOrchestrator,
};
use upsync_transport::{AccountResolver, Transport};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct UploadListQuery {
    account: Option<String>,
    status: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseState {
    pub paused: bool,
}

type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    pub storage: UpsyncStorage,
    pub transport: Arc<dyn Transport>,
    pub accounts: Arc<dyn AccountResolver>,
    pub conditions: Arc<StaticConditions>,
    pub pause: PauseSwitch,
    pub orchestrator_config: OrchestratorConfig,
    pub event_bus: broadcast::Sender<UploadEvent>,
    pub running: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    pub auth_token: Option<String>,
    pub require_bearer: bool,
}

impl AppState {
    pub fn new(
        storage: UpsyncStorage,
        transport: Arc<dyn Transport>,
        accounts: Arc<dyn AccountResolver>,
        orchestrator_config: OrchestratorConfig,
        auth_token: Option<String>,
        require_bearer: bool,
    ) -> Self {
        let (event_bus, _) = broadcast::channel(256);
        Self {
            storage,
            transport,
            accounts,
            conditions: Arc::new(StaticConditions::new(DeviceConditions::online())),
            pause: PauseSwitch::default(),
            orchestrator_config,
            event_bus,
            running: Arc::new(RwLock::new(HashMap::new())),
            auth_token,
            require_bearer,
        }
    }

    fn orchestrator(&self, cancel: CancellationToken) -> UploadOrchestrator {
        UploadOrchestrator::new(
            Arc::new(self.storage.clone()),
            self.transport.clone(),
            self.accounts.clone(),
            Gate::new(self.conditions.clone(), self.pause.clone()),
            Arc::new(self.event_bus.clone()),
            self.orchestrator_config.clone(),
        )
        .with_hook(Arc::new(CollectionHook::new(self.transport.clone())))
        .with_cancel_token(cancel)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/v1/uploads", get(list_uploads).post(post_upload))
        .route("/v1/uploads/{id}", get(get_upload))
        .route("/v1/uploads/{id}/requeue", post(requeue_upload))
        .route("/v1/batches", post(post_batch))
        .route("/v1/batches/{run_id}", get(get_batch))
        .route("/v1/batches/{run_id}/cancel", post(cancel_batch))
        .route("/v1/batches/{run_id}/retry", post(retry_batch))
        .route(
            "/v1/device/conditions",
            get(get_conditions).put(put_conditions),
        )
        .route("/v1/device/pause", get(get_pause).put(put_pause))
        .route("/v1/events/stream", get(stream_events))
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn post_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewUpload>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let record = state
        .storage
        .enqueue(&payload)
        .await
        .map_err(internal_error)?;
    info!(upload_id = record.id, account = %record.account, "upload enqueued");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_uploads(
    State(state): State<AppState>,
    Query(query): Query<UploadListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state
        .storage
        .list_uploads(
            query.account.as_deref(),
            query.status.as_deref(),
            query.limit.unwrap_or(100),
        )
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::OK, Json(json!({ "items": items }))))
}

async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.storage.get_upload(id).await.map_err(internal_error)? {
        Some(record) => Ok((StatusCode::OK, Json(record))),
        None => Err(not_found("upload_not_found")),
    }
}

async fn requeue_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    if state
        .storage
        .get_upload(id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found("upload_not_found"));
    }

    if state.storage.requeue(id).await.map_err(internal_error)? {
        Ok((StatusCode::OK, Json(json!({ "upload_id": id, "status": "queued" }))))
    } else {
        Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "upload_in_progress" })),
        ))
    }
}

async fn post_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BatchInput>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;

    let input_msgpack = payload
        .to_bytes()
        .map_err(|err| internal_error(err.into()))?;
    let run_id = Uuid::now_v7();
    let run = state
        .storage
        .create_batch_run(
            &run_id.to_string(),
            payload.account.as_deref().unwrap_or_default(),
            &input_msgpack,
        )
        .await
        .map_err(internal_error)?;

    let cancel = CancellationToken::new();
    state.running.write().await.insert(run_id, cancel.clone());
    spawn_batch(state.clone(), run_id, payload, cancel);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "run_id": run_id,
            "submitted_at": run.submitted_at,
            "status_url": format!("/v1/batches/{run_id}")
        })),
    ))
}

/// Runs a batch in the background. `cancel` must already be registered in `running`.
fn spawn_batch(state: AppState, run_id: Uuid, input: BatchInput, cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(err) = process_batch(state, run_id, input, cancel).await {
            error!(%run_id, error = %err, "batch processing failed");
        }
    });
}

async fn process_batch(
    state: AppState,
    run_id: Uuid,
    input: BatchInput,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let ledger_id = run_id.to_string();
    if let Err(err) = state.storage.start_batch_run(&ledger_id).await {
        state.running.write().await.remove(&run_id);
        return Err(err);
    }

    let mut orchestrator = state.orchestrator(cancel);
    let result = orchestrator.run_as(run_id, input).await;
    // deregister before the ledger flips to a retryable state
    state.running.write().await.remove(&run_id);

    let (status, reason) = match &result {
        Ok(summary) if summary.stop == StopReason::Cancelled => {
            (BatchRunStatus::RetryPending, Some("cancelled".to_string()))
        }
        Ok(_) => (BatchRunStatus::Succeeded, None),
        Err(err) if err.is_retryable() => (BatchRunStatus::RetryPending, Some(err.to_string())),
        Err(err) => (BatchRunStatus::Failed, Some(err.to_string())),
    };
    state
        .storage
        .finish_batch_run(&ledger_id, status, reason.as_deref())
        .await?;
    info!(%run_id, status = status.as_str(), "batch run recorded");
    Ok(())
}

async fn get_batch(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state
        .storage
        .get_batch_run(&run_id)
        .await
        .map_err(internal_error)?
    {
        Some(run) => Ok((StatusCode::OK, Json(run))),
        None => Err(not_found("batch_not_found")),
    }
}

async fn cancel_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    match state.running.read().await.get(&run_id) {
        Some(token) => {
            token.cancel();
            info!(%run_id, "batch cancellation requested");
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "run_id": run_id, "status": "cancelling" })),
            ))
        }
        None => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "batch_not_running" })),
        )),
    }
}

async fn retry_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let run = state
        .storage
        .get_batch_run(&run_id.to_string())
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("batch_not_found"))?;

    let input = BatchInput::from_bytes(&run.input_msgpack)
        .map_err(|err| internal_error(err.into()))?;

    let cancel = CancellationToken::new();
    {
        let mut running = state.running.write().await;
        if run.status != BatchRunStatus::RetryPending.as_str() || running.contains_key(&run_id) {
            return Err((
                StatusCode::CONFLICT,
                Json(json!({ "error": "batch_not_retryable", "status": run.status })),
            ));
        }
        running.insert(run_id, cancel.clone());
    }
    warn!(%run_id, attempts = run.attempts, "retrying batch run");
    spawn_batch(state.clone(), run_id, input, cancel);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "run_id": run_id,
            "status_url": format!("/v1/batches/{run_id}")
        })),
    ))
}

async fn get_conditions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.conditions.current())
}

async fn put_conditions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DeviceConditions>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    state.conditions.set(payload);
    info!(
        connected = payload.connected,
        on_wifi = payload.on_wifi,
        charging = payload.charging,
        "device conditions updated"
    );
    Ok((StatusCode::OK, Json(payload)))
}

async fn get_pause(State(state): State<AppState>) -> impl IntoResponse {
    Json(PauseState {
        paused: state.pause.is_paused(),
    })
}

async fn put_pause(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PauseState>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    state.pause.set(payload.paused);
    info!(paused = payload.paused, "upload pause toggled");
    Ok((StatusCode::OK, Json(payload)))
}

async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let receiver = state.event_bus.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => {
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(SseEvent::default().event(event.name()).data(data)))
            }
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if !state.require_bearer {
        return Ok(());
    }

    let token = state.auth_token.as_deref().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error":"auth_token_required_but_not_configured"})),
        )
    })?;

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if provided == format!("Bearer {token}") {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_or_missing_bearer_token"})),
        ))
    }
}

fn not_found(code: &str) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": code })))
}

fn internal_error(error: anyhow::Error) -> ApiError {
    error!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal_error", "detail": error.to_string() })),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::to_bytes;
    use axum::response::Response;
    use upsync_storage::StorageConfig;
    use upsync_transport::{ScriptedTransport, StaticAccounts};

    use super::*;

    async fn state(dir: &tempfile::TempDir, require_bearer: bool) -> AppState {
        let storage = UpsyncStorage::connect(&StorageConfig {
            sqlite_path: dir.path().join("upsync.db").to_string_lossy().into_owned(),
        })
        .await
        .expect("connect");
        AppState::new(
            storage,
            Arc::new(ScriptedTransport::new()),
            Arc::new(StaticAccounts::new(["alice"], "memory://")),
            OrchestratorConfig::default(),
            Some("secret".to_string()),
            require_bearer,
        )
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn wait_for_run(state: &AppState, run_id: &str) -> String {
        for _ in 0..200 {
            if let Some(run) = state.storage.get_batch_run(run_id).await.expect("ledger") {
                if run.status != "queued" && run.status != "running" {
                    return run.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("batch {run_id} did not finish");
    }

    fn upload(dir: &tempfile::TempDir, name: &str) -> NewUpload {
        let local_path = dir.path().join(name);
        std::fs::write(&local_path, b"bytes").expect("write local file");
        NewUpload {
            account: "alice".to_string(),
            local_path,
            remote_path: format!("/Photos/{name}"),
            policy: Default::default(),
        }
    }

    #[tokio::test]
    async fn write_routes_require_bearer_when_enforced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, true).await;

        let rejected = put_pause(
            State(state.clone()),
            HeaderMap::new(),
            Json(PauseState { paused: true }),
        )
        .await
        .into_response();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
        assert!(!state.pause.is_paused());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Bearer secret".parse().expect("header value"),
        );
        let accepted = put_pause(State(state.clone()), headers, Json(PauseState { paused: true }))
            .await
            .into_response();
        assert_eq!(accepted.status(), StatusCode::OK);
        assert!(state.pause.is_paused());
    }

    #[tokio::test]
    async fn submitted_batch_runs_to_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, false).await;
        let mut events = state.event_bus.subscribe();

        let created = post_upload(State(state.clone()), HeaderMap::new(), Json(upload(&dir, "a.jpg")))
            .await
            .into_response();
        assert_eq!(created.status(), StatusCode::CREATED);
        let record = body_json(created).await;
        let id = record["id"].as_i64().expect("id");

        let input = BatchInput {
            account: Some("alice".to_string()),
            record_ids: Some(vec![id]),
            batch_index: Some(0),
            total_upload_size: Some(1),
            ..BatchInput::default()
        };
        let accepted = post_batch(State(state.clone()), HeaderMap::new(), Json(input))
            .await
            .into_response();
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);
        let run_id = body_json(accepted).await["run_id"]
            .as_str()
            .expect("run id")
            .to_string();

        assert_eq!(wait_for_run(&state, &run_id).await, "succeeded");
        let stored = state.storage.get_upload(id).await.expect("get").expect("row");
        assert_eq!(stored.status, upsync_contract::UploadStatus::Succeeded);
        assert!(matches!(
            events.recv().await.expect("event"),
            UploadEvent::BatchStarted { .. }
        ));
    }

    #[tokio::test]
    async fn offline_batch_becomes_retryable_and_retry_completes_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, false).await;
        state.conditions.set(DeviceConditions::offline());
        let record = state.storage.enqueue(&upload(&dir, "b.jpg")).await.expect("enqueue");

        let input = BatchInput {
            account: Some("alice".to_string()),
            record_ids: Some(vec![record.id]),
            batch_index: Some(0),
            total_upload_size: Some(1),
            ..BatchInput::default()
        };
        let accepted = post_batch(State(state.clone()), HeaderMap::new(), Json(input))
            .await
            .into_response();
        let run_id = body_json(accepted).await["run_id"]
            .as_str()
            .expect("run id")
            .to_string();
        assert_eq!(wait_for_run(&state, &run_id).await, "retry_pending");

        state.conditions.set(DeviceConditions::online());
        let run_uuid: Uuid = run_id.parse().expect("uuid");
        let retried = retry_batch(State(state.clone()), HeaderMap::new(), Path(run_uuid))
            .await
            .into_response();
        assert_eq!(retried.status(), StatusCode::ACCEPTED);

        // retried run goes back through running before it settles
        for _ in 0..200 {
            let run = state
                .storage
                .get_batch_run(&run_id)
                .await
                .expect("ledger")
                .expect("run");
            if run.attempts == 2 && run.status == "succeeded" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("retried batch {run_id} did not succeed");
    }

    #[tokio::test]
    async fn invalid_batch_is_recorded_as_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, false).await;

        let accepted = post_batch(
            State(state.clone()),
            HeaderMap::new(),
            Json(BatchInput {
                account: Some("alice".to_string()),
                ..BatchInput::default()
            }),
        )
        .await
        .into_response();
        let run_id = body_json(accepted).await["run_id"]
            .as_str()
            .expect("run id")
            .to_string();

        assert_eq!(wait_for_run(&state, &run_id).await, "failed");
        let run_uuid: Uuid = run_id.parse().expect("uuid");
        let retried = retry_batch(State(state.clone()), HeaderMap::new(), Path(run_uuid))
            .await
            .into_response();
        assert_eq!(retried.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, false).await;

        let missing = get_upload(State(state.clone()), Path(404)).await.into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let requeue = requeue_upload(State(state), HeaderMap::new(), Path(404))
            .await
            .into_response();
        assert_eq!(requeue.status(), StatusCode::NOT_FOUND);
    }
}
