//! Tenant-facing resource routes under `/my`.

mod fwrules;
mod jobs;
mod machines;

use std::str::FromStr;

use axum::Router;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

/// Create `/my` routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/fwrules", fwrules::routes())
        .nest("/machines", machines::routes())
        .nest("/jobs", jobs::routes())
}

/// Parse a path id. Anything that is not a well-formed id of the right kind
/// cannot name an existing resource.
fn parse_path_id<T: FromStr>(ctx: &RequestContext, kind: &str, raw: &str) -> Result<T, ApiError> {
    raw.parse().map_err(|_| {
        ctx.error(ApiError::not_found(
            format!("{kind}_not_found"),
            format!("{kind} {raw} not found"),
        ))
    })
}
