//! Shared harness for control-plane API tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobplane_control_plane::{
    actuation::{ActuationError, Actuator},
    api,
    control::ControlPlane,
    model::Machine,
    state::AppState,
};
use jobplane_jobs::{Job, JobTask};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Actuator the tests steer: it can hold every job until released, and fail
/// chosen tasks.
pub struct ScriptedActuator {
    held: watch::Sender<bool>,
    failing: Mutex<HashSet<JobTask>>,
}

impl ScriptedActuator {
    fn new() -> Self {
        Self {
            held: watch::channel(false).0,
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Block actuation until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Fail every job of `task` until [`succeed`](Self::succeed).
    pub fn fail(&self, task: JobTask) {
        self.failing.lock().unwrap().insert(task);
    }

    pub fn succeed(&self, task: JobTask) {
        self.failing.lock().unwrap().remove(&task);
    }
}

#[async_trait]
impl Actuator for ScriptedActuator {
    async fn actuate(&self, job: &Job) -> Result<(), ActuationError> {
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !held).await;

        if self.failing.lock().unwrap().contains(&job.task()) {
            return Err(ActuationError::Rejected(format!(
                "fabric refused {} on {} (code 0x2f)",
                job.task(),
                job.target()
            )));
        }
        Ok(())
    }
}

pub struct TestServer {
    pub base_url: String,
    pub client: reqwest::Client,
    pub control: ControlPlane,
    pub actuator: Arc<ScriptedActuator>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestServer {
    pub async fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,jobplane_control_plane=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let actuator = Arc::new(ScriptedActuator::new());
        let (control, executor, receiver) = ControlPlane::builder()
            .actuator(actuator.clone())
            .build();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            executor.run(receiver, shutdown_rx).await;
        });

        let state = AppState::new(control.clone(), Duration::from_secs(10));
        let app = api::create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            client: reqwest::Client::new(),
            control,
            actuator,
            shutdown_tx,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn register_machine(&self, name: &str) -> Machine {
        self.control.register_machine(name).await.unwrap()
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    pub async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.client.delete(self.url(path)).send().await.unwrap()
    }

    /// Wait server-side for the job and return the response.
    pub async fn wait_job(&self, job_id: &str, timeout_ms: u64) -> reqwest::Response {
        self.get(&format!("/my/jobs/{job_id}/wait?timeout_ms={timeout_ms}"))
            .await
    }

    /// Wait for the job and assert it succeeded.
    pub async fn wait_succeeded(&self, job_id: &str) -> Value {
        let resp = self.wait_job(job_id, 5_000).await;
        assert_eq!(resp.status(), StatusCode::OK, "job {job_id} did not succeed");
        let job: Value = resp.json().await.unwrap();
        assert_eq!(job["status"], "succeeded");
        job
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The `x-job-id` header of a mutating response.
pub fn job_id(resp: &reqwest::Response) -> String {
    resp.headers()
        .get("x-job-id")
        .expect("missing x-job-id header")
        .to_str()
        .unwrap()
        .to_string()
}
