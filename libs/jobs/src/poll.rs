//! Job polling protocol.
//!
//! [`wait_for_job`] re-reads the job from its [`JobSource`] until it reaches a
//! terminal status or the deadline passes, sleeping with exponential backoff
//! between reads. It holds nothing between reads, so a caller may drop the
//! future at any time and a later call simply resynchronizes from the
//! source's current state.

use std::time::Duration;

use async_trait::async_trait;
use jobplane_id::JobId;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::model::{Job, JobStatus};

/// Anything that can report the current state of a job.
#[async_trait]
pub trait JobSource: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the job, or `None` if no such job exists.
    async fn fetch_job(&self, job_id: &JobId) -> Result<Option<Job>, Self::Error>;
}

/// Shortest delay ever slept between two reads, whatever the configuration.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polling configuration.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay after the first non-terminal read.
    pub initial_interval: Duration,

    /// Upper bound for the delay between reads.
    pub max_interval: Duration,

    /// Growth factor applied to the delay after every read.
    pub multiplier: f64,

    /// Upper bound on the total wait.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            timeout: Duration::from_secs(600),
        }
    }
}

impl PollConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self.max_interval = self.max_interval.max(interval);
        self
    }

    /// Delay to wait after the given (zero-based) non-terminal read. Never
    /// shorter than [`MIN_POLL_INTERVAL`].
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_interval.as_millis() as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64).max(MIN_POLL_INTERVAL)
    }
}

/// Why a wait did not produce a succeeded job.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The deadline passed before the job reached a terminal status.
    /// The job itself is unaffected.
    #[error("timed out after {elapsed:?} waiting for job {job_id} (last status: {})", display_status(.last_status))]
    Timeout {
        job_id: JobId,
        elapsed: Duration,
        last_status: Option<JobStatus>,
    },

    /// The job reached `failed`.
    #[error("job {} failed: {}", .0.id(), .0.error().unwrap_or("unknown error"))]
    JobFailed(Box<Job>),

    /// The source has no such job.
    #[error("job {0} not found")]
    NotFound(JobId),

    /// The source could not be read.
    #[error("failed to fetch job: {0}")]
    Source(#[source] E),
}

fn display_status(status: &Option<JobStatus>) -> &'static str {
    status.map(|s| s.as_str()).unwrap_or("unknown")
}

/// Wait until `job_id` is terminal.
///
/// Returns the job if it succeeded, [`PollError::JobFailed`] if it failed, and
/// [`PollError::Timeout`] if `config.timeout` elapsed first.
pub async fn wait_for_job<S>(
    source: &S,
    job_id: &JobId,
    config: &PollConfig,
) -> Result<Job, PollError<S::Error>>
where
    S: JobSource + ?Sized,
{
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut last_status = None;
    let mut attempt = 0u32;

    loop {
        let fetched = match tokio::time::timeout_at(deadline, source.fetch_job(job_id)).await {
            Ok(result) => result.map_err(PollError::Source)?,
            Err(_) => {
                return Err(PollError::Timeout {
                    job_id: *job_id,
                    elapsed: started.elapsed(),
                    last_status,
                })
            }
        };
        let job = fetched.ok_or(PollError::NotFound(*job_id))?;

        match job.status() {
            JobStatus::Succeeded => return Ok(job),
            JobStatus::Failed => return Err(PollError::JobFailed(Box::new(job))),
            status => {
                last_status = Some(status);
                let now = Instant::now();
                if now >= deadline {
                    return Err(PollError::Timeout {
                        job_id: *job_id,
                        elapsed: now - started,
                        last_status,
                    });
                }

                let delay = config.delay(attempt).min(deadline - now);
                debug!(
                    job_id = %job_id,
                    status = %status,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Job not terminal yet"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
