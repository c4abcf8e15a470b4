//! Job store.
//!
//! The store is the record of every job ever accepted. Jobs are appended on
//! acceptance and only ever move forward through their lifecycle; nothing is
//! deleted. Durable backends implement [`JobStore`]; [`MemoryJobStore`] keeps
//! everything in process.

use std::collections::HashMap;

use async_trait::async_trait;
use jobplane_id::JobId;
use jobplane_jobs::{Job, JobFilter, TransitionError};
use thiserror::Error;
use tokio::sync::RwLock;

/// Job store errors.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} already exists")]
    Duplicate(JobId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

/// A lifecycle step applied by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start,
    Succeed,
    Fail(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Record a newly accepted job.
    async fn insert(&self, job: Job) -> Result<(), JobStoreError>;

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs matching `filter`, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Apply a lifecycle step atomically and return the updated job.
    async fn transition(&self, job_id: &JobId, step: Transition) -> Result<Job, JobStoreError>;

    /// Cheap reachability check for readiness.
    async fn health_check(&self) -> Result<(), JobStoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryJobs {
    jobs: HashMap<JobId, Job>,
    order: Vec<JobId>,
}

/// In-process job store.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<MemoryJobs>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let mut inner = self.inner.write().await;
        let job_id = job.id();
        if inner.jobs.contains_key(&job_id) {
            return Err(JobStoreError::Duplicate(job_id));
        }
        inner.order.push(job_id);
        inner.jobs.insert(job_id, job);
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.inner.read().await.jobs.get(job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| filter.matches(job))
            .cloned()
            .collect())
    }

    async fn transition(&self, job_id: &JobId, step: Transition) -> Result<Job, JobStoreError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or(JobStoreError::NotFound(*job_id))?;

        // Apply to a copy so a rejected step leaves the stored job untouched.
        let mut next = job.clone();
        match step {
            Transition::Start => next.start()?,
            Transition::Succeed => next.succeed()?,
            Transition::Fail(error) => next.fail(error)?,
        }
        *job = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use jobplane_id::{MachineId, RuleId};
    use jobplane_jobs::{JobAction, JobStatus, JobTask};

    use super::*;

    #[tokio::test]
    async fn test_insert_get_list() {
        let store = MemoryJobStore::new();
        let vm = MachineId::new();
        let a = Job::new(JobAction::RebootVm, vm);
        let b = Job::new(JobAction::EnableRule, RuleId::new());
        let c = Job::new(JobAction::RebootVm, vm);
        for job in [&a, &b, &c] {
            store.insert(job.clone()).await.unwrap();
        }

        assert_eq!(store.get(&b.id()).await.unwrap(), Some(b.clone()));
        assert_eq!(store.get(&JobId::new()).await.unwrap(), None);

        let all: Vec<JobId> = store
            .list(&JobFilter::default())
            .await
            .unwrap()
            .iter()
            .map(Job::id)
            .collect();
        assert_eq!(all, vec![a.id(), b.id(), c.id()]);

        let reboots = store
            .list(&JobFilter::default().with_target(vm).with_task(JobTask::RebootVm))
            .await
            .unwrap();
        assert_eq!(reboots.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_insert() {
        let store = MemoryJobStore::new();
        let job = Job::new(JobAction::DeleteRule, RuleId::new());
        store.insert(job.clone()).await.unwrap();
        assert!(matches!(
            store.insert(job).await,
            Err(JobStoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_transitions_are_forward_only() {
        let store = MemoryJobStore::new();
        let job = Job::new(JobAction::StopVm, MachineId::new());
        let id = job.id();
        store.insert(job).await.unwrap();

        assert_eq!(
            store.transition(&id, Transition::Start).await.unwrap().status(),
            JobStatus::Running
        );
        let failed = store
            .transition(&id, Transition::Fail("stop-vm failed: rejected".into()))
            .await
            .unwrap();
        assert_eq!(failed.error(), Some("stop-vm failed: rejected"));

        let err = store.transition(&id, Transition::Succeed).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Transition(_)));

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Failed);
        assert_eq!(stored.error(), Some("stop-vm failed: rejected"));
    }

    #[tokio::test]
    async fn test_transition_unknown_job() {
        let store = MemoryJobStore::new();
        assert!(matches!(
            store.transition(&JobId::new(), Transition::Start).await,
            Err(JobStoreError::NotFound(_))
        ));
    }
}
