//! Actuation of accepted jobs against the hypervisor / network fabric.
//!
//! The executor calls an [`Actuator`] once per job and treats the call as a
//! single logical attempt. [`RetryingActuator`] wraps another actuator to
//! retry transient failures a bounded number of times underneath that
//! attempt.

use std::time::Duration;

use async_trait::async_trait;
use jobplane_jobs::Job;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Actuation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActuationError {
    /// The backend could not be reached. Retryable.
    #[error("actuator unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the change.
    #[error("actuation rejected: {0}")]
    Rejected(String),

    #[error("actuation failed: {0}")]
    Internal(String),
}

impl ActuationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Short category safe to expose on the job record.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "backend unavailable",
            Self::Rejected(_) => "rejected by backend",
            Self::Internal(_) => "internal error",
        }
    }
}

/// Applies a job's side effect to the outside world.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn actuate(&self, job: &Job) -> Result<(), ActuationError>;
}

/// Actuator that only simulates latency. Used in dev mode and tests.
#[derive(Debug, Clone)]
pub struct SimulatedActuator {
    latency: Duration,
}

impl SimulatedActuator {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Actuator for SimulatedActuator {
    async fn actuate(&self, job: &Job) -> Result<(), ActuationError> {
        debug!(
            job_id = %job.id(),
            task = %job.task(),
            target = %job.target(),
            latency_ms = self.latency.as_millis() as u64,
            "Simulating actuation"
        );
        tokio::time::sleep(self.latency).await;
        Ok(())
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);
        Duration::from_millis(delay as u64)
    }
}

/// Retries retryable failures of the wrapped actuator.
pub struct RetryingActuator<A> {
    inner: A,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl<A: Actuator> RetryingActuator<A> {
    pub fn new(inner: A, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

#[async_trait]
impl<A: Actuator> Actuator for RetryingActuator<A> {
    async fn actuate(&self, job: &Job) -> Result<(), ActuationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.actuate(job).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(job_id = %job.id(), attempt, "Actuation succeeded after retry");
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        job_id = %job.id(),
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Actuation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use jobplane_id::MachineId;
    use jobplane_jobs::JobAction;

    use super::*;

    /// Fails with the given error a fixed number of times, then succeeds.
    struct Flaky {
        failures: u32,
        error: ActuationError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Actuator for Flaky {
        async fn actuate(&self, _job: &Job) -> Result<(), ActuationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(2),
        }
    }

    fn job() -> Job {
        Job::new(JobAction::RebootVm, MachineId::new())
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let actuator = RetryingActuator::new(
            Flaky {
                failures: 2,
                error: ActuationError::Unavailable("hypervisor busy".into()),
                calls: AtomicU32::new(0),
            },
            3,
            fast_backoff(),
        );
        assert!(actuator.actuate(&job()).await.is_ok());
        assert_eq!(actuator.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let actuator = RetryingActuator::new(
            Flaky {
                failures: 10,
                error: ActuationError::Unavailable("hypervisor busy".into()),
                calls: AtomicU32::new(0),
            },
            3,
            fast_backoff(),
        );
        let err = actuator.actuate(&job()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(actuator.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_rejections() {
        let actuator = RetryingActuator::new(
            Flaky {
                failures: 1,
                error: ActuationError::Rejected("no such vm".into()),
                calls: AtomicU32::new(0),
            },
            5,
            fast_backoff(),
        );
        assert_eq!(
            actuator.actuate(&job()).await,
            Err(ActuationError::Rejected("no such vm".into()))
        );
        assert_eq!(actuator.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_delay_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(30), Duration::from_secs(5));
    }

    #[test]
    fn test_category_hides_detail() {
        let err = ActuationError::Internal("segfault in fabricd at 0xdeadbeef".into());
        assert_eq!(err.category(), "internal error");
    }
}
