//! HTTP API handlers and routing.

pub mod error;
mod health;
mod my;
pub mod request_context;

use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use jobplane_id::JobId;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Response header carrying the id of the job a mutating request created.
pub const JOB_ID_HEADER: &str = "x-job-id";

/// Older name of [`JOB_ID_HEADER`], still sent for existing clients.
pub const JOB_ID_ALIAS_HEADER: &str = "x-joyent-jobid";

/// Response headers naming the job a mutating request created.
pub(crate) fn job_headers(job_id: JobId) -> [(&'static str, String); 2] {
    let id = job_id.to_string();
    [(JOB_ID_HEADER, id.clone()), (JOB_ID_ALIAS_HEADER, id)]
}

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([
            HeaderName::from_static(JOB_ID_HEADER),
            HeaderName::from_static(JOB_ID_ALIAS_HEADER),
        ])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .nest("/my", my::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::sync::watch;
    use tower::ServiceExt;

    use super::*;
    use crate::control::ControlPlane;

    /// Router with a running executor; it stops when the sender is dropped.
    fn router() -> (Router, watch::Sender<bool>) {
        let (control, executor, receiver) = ControlPlane::builder().build();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move { executor.run(receiver, rx).await });
        (create_router(AppState::new(control, Duration::from_secs(1))), tx)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_malformed_id_is_not_found() {
        let (router, _shutdown) = router();
        let response = router
            .oneshot(
                Request::get("/my/fwrules/not-a-rule")
                    .header("x-request-id", "req-test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/problem+json"
        );
        let problem = body_json(response).await;
        assert_eq!(problem["code"], "rule_not_found");
        assert_eq!(problem["request_id"], "req-test");
    }

    #[tokio::test]
    async fn test_create_answers_with_job_header() {
        let (router, _shutdown) = router();
        let response = router
            .oneshot(
                Request::post("/my/fwrules")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"rule":"FROM any TO all vms ALLOW tcp port 22"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let job_id = response.headers()[JOB_ID_HEADER].to_str().unwrap().to_string();
        assert!(job_id.starts_with("job_"));
        assert_eq!(response.headers()[JOB_ID_ALIAS_HEADER], job_id.as_str());
        let rule = body_json(response).await;
        assert_eq!(rule["enabled"], false);
    }

    #[tokio::test]
    async fn test_cors_exposes_job_headers() {
        let (router, _shutdown) = router();
        let response = router
            .oneshot(
                Request::post("/my/fwrules")
                    .header(header::ORIGIN, "https://console.example.com")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"rule":"FROM any TO all vms ALLOW tcp port 22"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let exposed = response.headers()[header::ACCESS_CONTROL_EXPOSE_HEADERS]
            .to_str()
            .unwrap()
            .to_string();
        assert!(exposed.contains(JOB_ID_HEADER));
        assert!(exposed.contains(JOB_ID_ALIAS_HEADER));
    }

    #[tokio::test]
    async fn test_missing_body_is_bad_request() {
        let (router, _shutdown) = router();
        let response = router
            .oneshot(Request::post("/my/fwrules").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
