//! Machine endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use jobplane_id::MachineId;
use serde::Deserialize;

use super::parse_path_id;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::api::job_headers;
use crate::model::MachineAction;
use crate::state::AppState;

/// Create machine routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_machines))
        .route("/{machine_id}", get(get_machine).post(machine_action))
        .route("/{machine_id}/fwrules", get(list_machine_rules))
}

/// Action to perform. Accepted in the body or as `?action=`.
#[derive(Debug, Default, Deserialize)]
pub struct MachineActionRequest {
    pub action: Option<String>,
}

async fn list_machines(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.control().list_machines().await)
}

async fn get_machine(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(machine_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let machine_id: MachineId = parse_path_id(&ctx, "machine", &machine_id)?;
    let machine = state
        .control()
        .get_machine(&machine_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(machine))
}

/// Accept a power action. Answers 202 with the job; the machine changes
/// only once the job succeeds.
async fn machine_action(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(machine_id): Path<String>,
    Query(query): Query<MachineActionRequest>,
    payload: Result<Json<MachineActionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let machine_id: MachineId = parse_path_id(&ctx, "machine", &machine_id)?;

    let action = match (query.action, payload) {
        (Some(action), _) => action,
        (None, Ok(Json(MachineActionRequest { action: Some(action) }))) => action,
        (None, Ok(_)) => {
            return Err(ctx.error(ApiError::bad_request(
                "invalid_request",
                "missing machine action",
            )))
        }
        (None, Err(e)) => {
            return Err(ctx.error(ApiError::bad_request("invalid_request", e.body_text())))
        }
    };
    let action: MachineAction = action
        .parse()
        .map_err(|message: String| ctx.error(ApiError::bad_request("invalid_action", message)))?;

    let accepted = state
        .control()
        .machine_action(&machine_id, action)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((
        StatusCode::ACCEPTED,
        job_headers(accepted.job.id()),
        Json(accepted.job),
    ))
}

async fn list_machine_rules(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(machine_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let machine_id: MachineId = parse_path_id(&ctx, "machine", &machine_id)?;
    let rules = state
        .control()
        .list_machine_rules(&machine_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(rules))
}
