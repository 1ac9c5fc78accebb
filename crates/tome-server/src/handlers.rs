//! HTTP handlers grouped by resource: jobs, runs, transcript history.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;

use tome_core::events::RunEvent;
use tome_core::ids::{CorrelationToken, JobId};
use tome_core::job::Job;
use tome_engine::error::EngineError;
use tome_store::{import_job_dir, validate_job_dir, ArtifactStore, Database, JobRepo, RunRepo, StoreError};
use tome_telemetry::{LogQuery, LogRecord, SqliteLogSink};

use crate::orchestrator::RunOrchestrator;
use crate::server::AppState;

/// Shared state available to all handlers.
pub struct HandlerState {
    pub db: Database,
    pub artifacts: ArtifactStore,
    pub orchestrator: Option<Arc<dyn RunOrchestrator>>,
    /// Persisted WARN+ logs; `None` when log persistence is off.
    pub logs: Option<Arc<SqliteLogSink>>,
}

impl HandlerState {
    pub fn new(db: Database, artifacts: ArtifactStore) -> Self {
        Self {
            db,
            artifacts,
            orchestrator: None,
            logs: None,
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn RunOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_logs(mut self, logs: Arc<SqliteLogSink>) -> Self {
        self.logs = Some(logs);
        self
    }

    fn jobs(&self) -> JobRepo {
        JobRepo::new(self.db.clone())
    }

    fn orchestrator(&self) -> Result<&Arc<dyn RunOrchestrator>, ApiError> {
        self.orchestrator
            .as_ref()
            .ok_or_else(|| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "no run engine configured"))
    }
}

/// Error response: `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Store(inner) => inner.into(),
            EngineError::JobNotFound(_) => Self::not_found(e.to_string()),
            EngineError::AlreadyRunning(_) => Self::new(StatusCode::CONFLICT, e.to_string()),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Health ──────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let hs = &state.handler_state;
    let active_runs = hs.orchestrator.as_ref().map_or(0, |o| o.active_count());
    Json(json!({
        "status": "healthy",
        "engine": hs.orchestrator.is_some(),
        "active_runs": active_runs,
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────────

pub async fn list_jobs(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.handler_state.jobs().list()?))
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Job>> {
    Ok(Json(state.handler_state.jobs().get(JobId(id))?))
}

/// Create (no `id`) or update (with `id`) a job.
pub async fn save_job(State(state): State<AppState>, Json(mut job): Json<Job>) -> ApiResult<impl IntoResponse> {
    validate_job_dir(&job.dir)?;
    let created = job.id.is_none();
    let id = state.handler_state.jobs().save(&job)?;
    job.id = Some(id);
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(job)))
}

pub async fn delete_job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    state.handler_state.jobs().delete(JobId(id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ImportRequest {
    pub dir: String,
}

pub async fn import_job(
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> ApiResult<impl IntoResponse> {
    let hs = &state.handler_state;
    let mut job = import_job_dir(hs.artifacts.jobs_root(), &req.dir)?;
    job.id = Some(hs.jobs().save(&job)?);
    Ok((StatusCode::CREATED, Json(job)))
}

// ── Runs ────────────────────────────────────────────────────────────────────

pub async fn start_run(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    let token = state.handler_state.orchestrator()?.start(JobId(id)).await?;
    state.hub.open(&token);
    Ok((StatusCode::ACCEPTED, Json(json!({ "token": token }))))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let token = CorrelationToken::from_raw(token);
    if !state.handler_state.orchestrator()?.cancel(&token) {
        return Err(ApiError::not_found(format!("no active run {token}")));
    }
    Ok(Json(json!({ "cancelled": true })))
}

/// `text/event-stream` of one run's events, from its first event through
/// `done`.
pub async fn run_events(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let token = CorrelationToken::from_raw(token);
    let sub = state
        .hub
        .subscribe(&token)
        .ok_or_else(|| ApiError::not_found(format!("unknown run {token}")))?;

    let stream = async_stream::stream! {
        for event in sub.backlog {
            let done = event.is_done();
            if let Some(sse) = to_sse(&event) {
                yield Ok(sse);
            }
            if done {
                return;
            }
        }
        let Some(mut live) = sub.live else {
            return;
        };
        loop {
            match live.recv().await {
                Ok(event) => {
                    let done = event.is_done();
                    if let Some(sse) = to_sse(&event) {
                        yield Ok(sse);
                    }
                    if done {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(token = %token, skipped = n, "event stream lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &RunEvent) -> Option<Event> {
    match Event::default().event(event.event_type()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode run event");
            None
        }
    }
}

const MAX_LOG_RECORDS: u32 = 1000;

#[derive(Deserialize)]
pub struct LogParams {
    pub level: Option<String>,
    pub limit: Option<u32>,
}

/// Persisted WARN and ERROR records tagged with one run's token.
pub async fn run_logs(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(params): Query<LogParams>,
) -> ApiResult<Json<Vec<LogRecord>>> {
    let logs = state
        .handler_state
        .logs
        .as_ref()
        .ok_or_else(|| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "log persistence is disabled"))?;
    let query = LogQuery {
        level: params.level,
        token: Some(token),
        limit: Some(params.limit.unwrap_or(100).min(MAX_LOG_RECORDS)),
        ..LogQuery::default()
    };
    let records = logs
        .query(&query)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(records))
}

pub async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let hs = &state.handler_state;
    hs.jobs().get(JobId(id))?;
    Ok(Json(RunRepo::new(hs.db.clone()).list_for_job(JobId(id))?))
}

// ── History ─────────────────────────────────────────────────────────────────

pub async fn list_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let hs = &state.handler_state;
    let job = hs.jobs().get(JobId(id))?;
    Ok(Json(hs.artifacts.list_transcripts(&job.dir)?))
}

pub async fn read_history(
    State(state): State<AppState>,
    Path((id, filename)): Path<(i64, String)>,
) -> ApiResult<impl IntoResponse> {
    let hs = &state.handler_state;
    let job = hs.jobs().get(JobId(id))?;
    let text = hs.artifacts.read_transcript(&job.dir, &filename)?;
    Ok(([("content-type", "text/plain; charset=utf-8")], text))
}

#[derive(Deserialize)]
pub struct DeleteHistoryRequest {
    pub files: Vec<String>,
}

pub async fn delete_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<DeleteHistoryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let hs = &state.handler_state;
    let job = hs.jobs().get(JobId(id))?;
    let deleted = hs.artifacts.delete_transcripts(&job.dir, &req.files)?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_status() {
        let cases = [
            (StoreError::NotFound("job 1".into()), StatusCode::NOT_FOUND),
            (StoreError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (StoreError::Io("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn engine_errors_map_to_status() {
        assert_eq!(
            ApiError::from(EngineError::JobNotFound(JobId(3))).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(EngineError::AlreadyRunning(JobId(3))).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(EngineError::Store(StoreError::InvalidInput("x".into()))).status,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn sse_event_named_after_type() {
        let token = CorrelationToken::from_raw("run_1");
        let sse = to_sse(&RunEvent::status(&token, "working"));
        assert!(sse.is_some());
    }
}
