//! HTTP client for API communication.

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobplane_id::JobId;
use jobplane_jobs::{Job, JobSource};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::CliError;

/// Response header carrying the id of the job a mutation created.
pub const JOB_ID_HEADER: &str = "x-job-id";

/// Older name of [`JOB_ID_HEADER`], read when the primary one is absent.
pub const JOB_ID_ALIAS_HEADER: &str = "x-joyent-jobid";

/// A mutation the server accepted.
#[derive(Debug)]
pub struct Accepted<T> {
    pub body: T,
    pub job_id: JobId,
}

/// API client for communicating with the control plane.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build a URL for an endpoint.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Make a GET request.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self.client.get(self.url(path)).send().await?;
        self.handle_response(response).await
    }

    /// Make a POST request that creates a job.
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Accepted<T>, CliError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        if !response.status().is_success() {
            return self.handle_error(response).await;
        }
        let job_id = job_id_header(&response)?;
        let body = self.handle_response(response).await?;
        Ok(Accepted { body, job_id })
    }

    /// Make a DELETE request that creates a job.
    pub async fn delete(&self, path: &str) -> Result<JobId, CliError> {
        let response = self.client.delete(self.url(path)).send().await?;
        if !response.status().is_success() {
            return self.handle_error(response).await;
        }
        job_id_header(&response)
    }

    /// Handle a successful or error response.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, CliError> {
        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|e| CliError::Protocol(format!("failed to parse response: {e}")))
        } else {
            self.handle_error(response).await
        }
    }

    /// Handle an error response.
    async fn handle_error<T>(&self, response: reqwest::Response) -> Result<T, CliError> {
        let status = response.status().as_u16();

        let problem: Problem = response.json().await.unwrap_or_else(|_| Problem {
            code: "unknown".to_string(),
            detail: "Unknown error".to_string(),
            request_id: None,
            job_id: None,
        });

        Err(CliError::api(
            status,
            problem.code,
            problem.detail,
            problem.request_id,
            problem.job_id,
        ))
    }
}

fn job_id_header(response: &reqwest::Response) -> Result<JobId, CliError> {
    let headers = response.headers();
    let value = headers
        .get(JOB_ID_HEADER)
        .or_else(|| headers.get(JOB_ID_ALIAS_HEADER))
        .ok_or_else(|| CliError::Protocol(format!("missing {JOB_ID_HEADER} header")))?;
    value
        .to_str()
        .ok()
        .and_then(|v| JobId::parse(v).ok())
        .ok_or_else(|| CliError::Protocol(format!("malformed {JOB_ID_HEADER} header")))
}

#[async_trait]
impl JobSource for ApiClient {
    type Error = CliError;

    async fn fetch_job(&self, job_id: &JobId) -> Result<Option<Job>, Self::Error> {
        match self.get(&format!("/my/jobs/{job_id}")).await {
            Ok(job) => Ok(Some(job)),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND.as_u16()) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Problem details body (`application/problem+json`).
#[derive(Debug, Deserialize)]
struct Problem {
    code: String,
    detail: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    job_id: Option<String>,
}
