use std::io::ErrorKind;
use std::path::PathBuf;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio_util::io::ReaderStream;

use crate::api::models::{
    ErrorBody, HealthResponse, ListJobsQuery, ListJobsResponse, LogQuery, LogTailResponse,
    ReadyResponse, SubmitRequest,
};
use crate::error::{StatusError, SubmitError};
use crate::jobs::{JobStatus, Scheduler, Submitted, WorkDescriptor};

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Scheduler,
    /// Provisioning flag reported by `/health` and `/ready`. `None` counts
    /// as always ready.
    pub init_flag: Option<PathBuf>,
}

impl ApiState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            init_flag: None,
        }
    }

    pub fn with_init_flag(mut self, flag: impl Into<PathBuf>) -> Self {
        self.init_flag = Some(flag.into());
        self
    }

    async fn init_ready(&self) -> bool {
        match &self.init_flag {
            Some(flag) => tokio::fs::try_exists(flag).await.unwrap_or(false),
            None => true,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(get_status))
        .route("/jobs/:id/log", get(get_log))
        .route("/jobs/:id/files/*path", get(get_file))
        .route("/kinds", get(list_kinds))
        .route("/metrics/prom", get(metrics_prom))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: msg.into() })).into_response()
}

fn submit_err(e: SubmitError) -> Response {
    let status = match e {
        SubmitError::DuplicateId(_) => StatusCode::CONFLICT,
        SubmitError::ShuttingDown | SubmitError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        SubmitError::InvalidId(_) | SubmitError::UnknownKind(_) | SubmitError::BadDescriptor(_) => {
            StatusCode::BAD_REQUEST
        }
    };
    error_response(status, e.to_string())
}

fn status_err(e: StatusError) -> Response {
    match e {
        StatusError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "job not found"),
    }
}

pub async fn submit_job(
    State(state): State<ApiState>,
    Json(body): Json<SubmitRequest>,
) -> Result<Json<Submitted>, Response> {
    let SubmitRequest {
        kind,
        params,
        job_id,
    } = body;

    if kind.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "kind is required"));
    }

    state
        .scheduler
        .submit(WorkDescriptor { kind, params }, job_id)
        .await
        .map(Json)
        .map_err(submit_err)
}

pub async fn get_status(Path(id): Path<String>, State(state): State<ApiState>) -> Response {
    match state.scheduler.status().get_status(&id).await {
        Ok(rec) => (StatusCode::OK, Json(rec)).into_response(),
        Err(e) => status_err(e),
    }
}

pub async fn get_log(
    Path(id): Path<String>,
    State(state): State<ApiState>,
    Query(q): Query<LogQuery>,
) -> Response {
    match state.scheduler.status().get_log_tail(&id, q.tail).await {
        Ok(tail) => (
            StatusCode::OK,
            Json(LogTailResponse {
                log_tail: tail.text(),
                job_id: tail.job_id,
                status: tail.status,
            }),
        )
            .into_response(),
        Err(e) => status_err(e),
    }
}

/// Stream a file from a job directory. Paths that leave the directory are
/// 404; a missing file on an unfinished job is 409.
pub async fn get_file(
    Path((id, rel)): Path<(String, String)>,
    State(state): State<ApiState>,
) -> Response {
    let rel = rel.trim_start_matches('/');
    let Some(path) = state.scheduler.store().job_file(&id, rel) else {
        return error_response(StatusCode::NOT_FOUND, "file not found");
    };
    let rec = match state.scheduler.status().get_status(&id).await {
        Ok(rec) => rec,
        Err(e) => return status_err(e),
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound && !rec.is_terminal() => {
            return error_response(
                StatusCode::CONFLICT,
                format!("not ready yet: {}", rec.status),
            );
        }
        Err(_) => return error_response(StatusCode::NOT_FOUND, "file not found"),
    };
    let len = match file.metadata().await {
        Ok(m) if m.is_file() => m.len(),
        _ => return error_response(StatusCode::NOT_FOUND, "file not found"),
    };

    (
        [
            (header::CONTENT_TYPE, content_type(rel).to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

fn content_type(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("json") => "application/json",
        Some("log" | "txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, Response> {
    let status = match q.status.as_deref() {
        Some(s) => Some(JobStatus::parse(s).ok_or_else(|| {
            error_response(StatusCode::BAD_REQUEST, format!("unknown status {s:?}"))
        })?),
        None => None,
    };
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);

    let mut items = state.scheduler.status().list(status);
    // newest last; keep the most recent `limit`
    let skip = items.len().saturating_sub(limit);
    items.drain(..skip);

    Ok(Json(ListJobsResponse { items }))
}

pub async fn list_kinds(State(state): State<ApiState>) -> Json<Vec<String>> {
    Json(state.scheduler.planner_kinds())
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    let c = state.scheduler.status().counts();
    let body = format!(
        concat!(
            "# HELP genflow_jobs Resident jobs by status\n",
            "# TYPE genflow_jobs gauge\n",
            "genflow_jobs{{status=\"queued\"}} {}\n",
            "genflow_jobs{{status=\"running\"}} {}\n",
            "genflow_jobs{{status=\"succeeded\"}} {}\n",
            "genflow_jobs{{status=\"failed\"}} {}\n"
        ),
        c.queued, c.running, c.succeeded, c.failed
    );
    (StatusCode::OK, body).into_response()
}

pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        init_ready: state.init_ready().await,
    })
}

/// Ready when provisioning finished and every kind accepts submits.
pub async fn ready(State(state): State<ApiState>) -> Response {
    let init_ready = state.init_ready().await;
    let kinds = state.scheduler.readiness().await;
    let ready = init_ready && kinds.values().all(|r| *r);
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadyResponse {
            ready,
            init_ready,
            kinds,
        }),
    )
        .into_response()
}
