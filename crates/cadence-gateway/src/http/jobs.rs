//! Cron job API consumed by the dashboard: `/api/v1/cron/jobs*`.
//!
//! All bodies are camelCase JSON with millisecond timestamps. Failures come
//! back as `{"error": "...", "code": "..."}`.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cadence_scheduler::{
    Job, JobPatch, NewJob, Payload, RunRecord, Schedule, ScheduleInput, SchedulerError,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::app::AppState;

const DEFAULT_RUNS_LIMIT: usize = 20;

/// Error response with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_REQUEST",
            message: message.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status = match &e {
            SchedulerError::JobNotFound { .. } => StatusCode::NOT_FOUND,
            SchedulerError::RunSkipped { .. } => StatusCode::CONFLICT,
            SchedulerError::JobDisabled { .. } => StatusCode::BAD_REQUEST,
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(code = e.code(), "cron api failure: {e}");
        }
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"error": self.message, "code": self.code})),
        )
            .into_response()
    }
}

/// Body of `POST /api/v1/cron/jobs`. With `id` it edits that job, otherwise
/// it creates one.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInput {
    pub id: Option<String>,
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub schedule: Option<ScheduleInput>,
    pub payload: Option<Payload>,
    pub delete_after_run: Option<bool>,
}

impl JobInput {
    fn into_new_job(self) -> Result<NewJob, SchedulerError> {
        let schedule = self
            .schedule
            .ok_or_else(|| SchedulerError::InvalidSchedule("schedule is required".to_string()))
            .and_then(Schedule::try_from)?;
        let payload = self
            .payload
            .ok_or_else(|| SchedulerError::InvalidPayload("message text is required".to_string()))?;
        Ok(NewJob::new(self.name.unwrap_or_default(), schedule, payload)
            .enabled(self.enabled.unwrap_or(true))
            .delete_after_run(self.delete_after_run.unwrap_or(false)))
    }

    fn into_patch(self) -> Result<JobPatch, SchedulerError> {
        Ok(JobPatch {
            name: self.name,
            enabled: self.enabled,
            schedule: self.schedule.map(Schedule::try_from).transpose()?,
            payload: self.payload,
            delete_after_run: self.delete_after_run,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct IdBody {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct EnableBody {
    pub id: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub id: String,
    pub limit: Option<usize>,
}

/// GET /api/v1/cron/jobs: all jobs, oldest first.
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.scheduler.list()?))
}

/// POST /api/v1/cron/jobs: create (201) or update (200).
pub async fn upsert_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JobInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let Json(input) = body?;
    match input.id.clone() {
        Some(id) => {
            let job = state.scheduler.update(&id, input.into_patch()?)?;
            Ok((StatusCode::OK, Json(job)))
        }
        None => {
            let job = state.scheduler.create(input.into_new_job()?)?;
            Ok((StatusCode::CREATED, Json(job)))
        }
    }
}

/// DELETE /api/v1/cron/jobs?id=: idempotent.
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    query: Result<Query<IdQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(IdQuery { id }) = query?;
    let deleted = state.scheduler.delete(&id)?;
    Ok(Json(json!({"deleted": deleted})))
}

/// POST /api/v1/cron/jobs/enable: `{id, enabled}`.
pub async fn enable_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<EnableBody>, JsonRejection>,
) -> Result<Json<Job>, ApiError> {
    let Json(EnableBody { id, enabled }) = body?;
    Ok(Json(state.scheduler.set_enabled(&id, enabled)?))
}

/// POST /api/v1/cron/jobs/test: start a manual run; poll the job for the result.
pub async fn test_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<IdBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(IdBody { id }) = body?;
    state.scheduler.test_run(&id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "started", "id": id})),
    ))
}

/// GET /api/v1/cron/jobs/runs?id=&limit=: run history, newest first.
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RunsQuery>, QueryRejection>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    let Query(RunsQuery { id, limit }) = query?;
    let max = state.config.scheduler.run_history_limit.max(1);
    let limit = limit.unwrap_or(DEFAULT_RUNS_LIMIT).clamp(1, max);
    Ok(Json(state.scheduler.runs(&id, limit)?))
}
