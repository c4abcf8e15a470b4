//! Firewall rule endpoints.
//!
//! Mutations answer immediately with the id of the job that will apply them
//! in the `x-job-id` header. Reads only ever return committed rules.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use jobplane_id::RuleId;
use serde::Deserialize;

use super::parse_path_id;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::api::job_headers;
use crate::state::AppState;

/// Create firewall rule routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rules).post(create_rule))
        .route(
            "/{rule_id}",
            get(get_rule).post(update_rule).delete(delete_rule),
        )
        .route("/{rule_id}/enable", post(enable_rule))
        .route("/{rule_id}/disable", post(disable_rule))
        .route("/{rule_id}/machines", get(list_rule_machines))
}

/// Body of create and update requests.
#[derive(Debug, Deserialize)]
pub struct RuleRequest {
    /// Rule text, e.g. `FROM vm <id> TO subnet 10.99.99.0/24 ALLOW tcp port 80`.
    pub rule: String,
}

fn rule_body(
    ctx: &RequestContext,
    payload: Result<Json<RuleRequest>, JsonRejection>,
) -> Result<RuleRequest, ApiError> {
    payload
        .map(|Json(req)| req)
        .map_err(|e| ctx.error(ApiError::bad_request("invalid_request", e.body_text())))
}

async fn list_rules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.control().list_rules().await)
}

async fn create_rule(
    State(state): State<AppState>,
    ctx: RequestContext,
    payload: Result<Json<RuleRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = rule_body(&ctx, payload)?;
    let accepted = state
        .control()
        .create_rule(&req.rule)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((
        StatusCode::CREATED,
        job_headers(accepted.job.id()),
        Json(accepted.resource),
    ))
}

async fn get_rule(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(rule_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rule_id: RuleId = parse_path_id(&ctx, "rule", &rule_id)?;
    let rule = state
        .control()
        .get_rule(&rule_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(rule))
}

async fn update_rule(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(rule_id): Path<String>,
    payload: Result<Json<RuleRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let rule_id: RuleId = parse_path_id(&ctx, "rule", &rule_id)?;
    let req = rule_body(&ctx, payload)?;
    let accepted = state
        .control()
        .update_rule(&rule_id, &req.rule)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((
        job_headers(accepted.job.id()),
        Json(accepted.resource),
    ))
}

async fn enable_rule(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(rule_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rule_id: RuleId = parse_path_id(&ctx, "rule", &rule_id)?;
    let accepted = state
        .control()
        .enable_rule(&rule_id)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((
        job_headers(accepted.job.id()),
        Json(accepted.resource),
    ))
}

async fn disable_rule(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(rule_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rule_id: RuleId = parse_path_id(&ctx, "rule", &rule_id)?;
    let accepted = state
        .control()
        .disable_rule(&rule_id)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((
        job_headers(accepted.job.id()),
        Json(accepted.resource),
    ))
}

async fn delete_rule(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(rule_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rule_id: RuleId = parse_path_id(&ctx, "rule", &rule_id)?;
    let accepted = state
        .control()
        .delete_rule(&rule_id)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((
        StatusCode::NO_CONTENT,
        job_headers(accepted.job.id()),
    ))
}

async fn list_rule_machines(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(rule_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rule_id: RuleId = parse_path_id(&ctx, "rule", &rule_id)?;
    let machines = state
        .control()
        .list_rule_machines(&rule_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(machines))
}
