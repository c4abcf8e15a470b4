//! Job endpoints: lookup, filtered listing and server-side waiting.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use jobplane_id::{JobId, MachineId};
use jobplane_jobs::{JobFilter, JobStatus, JobTarget, JobTask};
use serde::Deserialize;

use super::parse_path_id;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

/// Create job routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{job_id}", get(get_job))
        .route("/{job_id}/wait", get(wait_job))
}

/// Query parameters for listing jobs.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    /// Target resource id (rule or machine).
    pub target: Option<String>,

    /// Machine id; shorthand for `target` on machine jobs.
    pub vm_uuid: Option<String>,

    pub task: Option<String>,

    pub status: Option<String>,
}

impl ListJobsQuery {
    fn into_filter(self) -> Result<JobFilter, ApiError> {
        let mut filter = JobFilter::default();

        let target = self
            .target
            .map(|t| {
                t.parse::<JobTarget>()
                    .map_err(|e| ApiError::bad_request("invalid_target", e.to_string()))
            })
            .transpose()?;
        let vm = self
            .vm_uuid
            .map(|id| {
                MachineId::parse(&id)
                    .map(JobTarget::Machine)
                    .map_err(|e| ApiError::bad_request("invalid_vm_uuid", e.to_string()))
            })
            .transpose()?;

        filter.target = match (target, vm) {
            (Some(a), Some(b)) if a != b => {
                return Err(ApiError::bad_request(
                    "invalid_target",
                    "target and vm_uuid name different resources",
                ))
            }
            (a, b) => a.or(b),
        };

        if let Some(task) = self.task {
            let task: JobTask = task
                .parse()
                .map_err(|e: jobplane_jobs::ParseEnumError| {
                    ApiError::bad_request("invalid_task", e.to_string())
                })?;
            filter = filter.with_task(task);
        }
        if let Some(status) = self.status {
            let status: JobStatus = status
                .parse()
                .map_err(|e: jobplane_jobs::ParseEnumError| {
                    ApiError::bad_request("invalid_status", e.to_string())
                })?;
            filter = filter.with_status(status);
        }

        Ok(filter)
    }
}

/// Query parameters for waiting on a job.
#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    /// How long to wait; capped by the server maximum.
    pub timeout_ms: Option<u64>,
}

async fn list_jobs(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = query.into_filter().map_err(|e| ctx.error(e))?;
    let jobs = state
        .control()
        .list_jobs(&filter)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id: JobId = parse_path_id(&ctx, "job", &job_id)?;
    let job = state
        .control()
        .get_job(&job_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(job))
}

/// Block until the job is terminal. 200 with the job if it succeeded, 502 if
/// it failed, 504 if the timeout passed first.
async fn wait_job(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(job_id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id: JobId = parse_path_id(&ctx, "job", &job_id)?;
    let timeout = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.max_wait())
        .min(state.max_wait());

    let job = state
        .control()
        .wait_job(&job_id, timeout)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(job))
}
