//! Job executor.
//!
//! Accepted job ids arrive on a [`JobQueue`]. The executor runs each job in
//! its own task, bounded by a semaphore, and drives it through
//! `queued -> running -> succeeded | failed`. The terminal status is recorded
//! while holding the target resource's critical section, together with the
//! resource commit (on success) or release (on failure).

use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use jobplane_id::JobId;
use jobplane_jobs::{Job, JobAction, JobStatus, JobTarget};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::actuation::Actuator;
use crate::model::{next_machine, next_rule, UnsupportedTask};
use crate::resources::{ResourceTable, Resources};
use crate::store::{JobStore, JobStoreError, Transition};

/// Sending half of the job queue, held by the control surface.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<JobId>,
}

/// Receiving half of the job queue, consumed by [`JobExecutor::run`].
#[derive(Debug)]
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<JobId>,
}

/// Create a connected job queue.
pub fn job_queue() -> (JobQueue, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (JobQueue { tx }, JobReceiver { rx })
}

impl JobQueue {
    /// Hand a job to the executor. Fails once the executor has stopped.
    pub fn enqueue(&self, job_id: JobId) -> Result<(), JobId> {
        self.tx.send(job_id).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of jobs executing at once.
    pub concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

/// Runs accepted jobs to completion.
#[derive(Clone)]
pub struct JobExecutor {
    jobs: Arc<dyn JobStore>,
    resources: Arc<Resources>,
    actuator: Arc<dyn Actuator>,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        resources: Arc<Resources>,
        actuator: Arc<dyn Actuator>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            jobs,
            resources,
            actuator,
            config,
        }
    }

    /// Run the executor until shutdown is signaled or the queue closes.
    ///
    /// Jobs already started are awaited before returning.
    #[instrument(skip_all)]
    pub async fn run(&self, receiver: JobReceiver, mut shutdown: watch::Receiver<bool>) {
        let JobReceiver { mut rx } = receiver;
        let concurrency = self.config.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();

        info!(concurrency, "Starting job executor");

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(job_id) = received else {
                        info!("Job queue closed");
                        break;
                    };
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let executor = self.clone();
                    tasks.spawn(async move {
                        executor.execute(job_id).await;
                        drop(permit);
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Job task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Job executor shutting down");
                        break;
                    }
                }
            }
        }

        // Stop accepting; jobs still queued stay `queued` in the store.
        rx.close();
        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight jobs");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task panicked");
            }
        }
    }

    /// Drive one job to a terminal status.
    pub async fn execute(&self, job_id: JobId) {
        let job = match self.jobs.transition(&job_id, Transition::Start).await {
            Ok(job) => job,
            Err(e @ (JobStoreError::NotFound(_) | JobStoreError::Transition(_))) => {
                error!(job_id = %job_id, error = %e, "Failed to start job");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to start job");
                self.abandon(job_id).await;
                return;
            }
        };
        debug!(job_id = %job_id, task = %job.task(), target = %job.target(), "Job running");

        if !self.is_reserved_by(&job).await {
            warn!(job_id = %job_id, target = %job.target(), "Job target no longer reserved");
            self.record_failure(&job, "target is no longer reserved").await;
            return;
        }

        let outcome = self.actuator.actuate(&job).await.map_err(|e| {
            error!(
                job_id = %job_id,
                task = %job.task(),
                target = %job.target(),
                error = %e,
                "Actuation failed"
            );
            e.category()
        });

        match job.target() {
            JobTarget::Rule(id) => {
                let action = job.action().clone();
                let accepted_at = job.created_at();
                self.finish(&self.resources.rules, &id, &job, outcome, move |current| {
                    next_rule(id, current, &action, accepted_at)
                })
                .await
            }
            JobTarget::Machine(id) => {
                let action: JobAction = job.action().clone();
                self.finish(&self.resources.machines, &id, &job, outcome, move |current| {
                    next_machine(current, &action)
                })
                .await
            }
        }
    }

    /// Free the target of a job that could not be started. A job the store
    /// did record as running is failed; one still `queued` stays queued,
    /// since the store just refused to move it.
    async fn abandon(&self, job_id: JobId) {
        let job = match self.jobs.get(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to load unstarted job");
                return;
            }
        };

        if job.status() == JobStatus::Running {
            self.record_failure(&job, "internal error").await;
        }

        let released = match job.target() {
            JobTarget::Rule(id) => self.resources.rules.release(&id, job_id).await,
            JobTarget::Machine(id) => self.resources.machines.release(&id, job_id).await,
        };
        match released {
            Ok(()) => {
                warn!(job_id = %job_id, target = %job.target(), "Released target of unstarted job")
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to clear pending job"),
        }
    }

    async fn is_reserved_by(&self, job: &Job) -> bool {
        let pending = match job.target() {
            JobTarget::Rule(id) => self.resources.rules.pending_job(&id).await,
            JobTarget::Machine(id) => self.resources.machines.pending_job(&id).await,
        };
        pending == Some(job.id())
    }

    /// Record the terminal status and commit or release the resource, inside
    /// the resource's critical section.
    async fn finish<K, T, F>(
        &self,
        table: &ResourceTable<K, T>,
        id: &K,
        job: &Job,
        outcome: Result<(), &'static str>,
        next: F,
    ) where
        K: Clone + Eq + Hash + Display + Send + Sync,
        T: Clone + Send + Sync,
        F: FnOnce(Option<T>) -> Result<Option<T>, UnsupportedTask>,
    {
        let job_id = job.id();
        let Some(slot) = table.lock(id).await else {
            warn!(job_id = %job_id, target = %job.target(), "Job target disappeared");
            self.record_failure(job, "target no longer exists").await;
            return;
        };

        let next = outcome.and_then(|()| {
            next(slot.committed().cloned()).map_err(|e| {
                error!(job_id = %job_id, error = %e, "Job cannot be applied to its target");
                "unsupported task"
            })
        });

        let released = match next {
            Ok(fields) => match self.jobs.transition(&job_id, Transition::Succeed).await {
                Ok(_) => {
                    info!(job_id = %job_id, task = %job.task(), target = %job.target(), "Job succeeded");
                    slot.commit(job_id, fields).await
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Failed to record job success");
                    self.record_failure(job, "internal error").await;
                    slot.release(job_id).await
                }
            },
            Err(category) => {
                let message = failure_message(job, category);
                if let Err(e) = self
                    .jobs
                    .transition(&job_id, Transition::Fail(message.clone()))
                    .await
                {
                    error!(job_id = %job_id, error = %e, "Failed to record job failure");
                }
                info!(job_id = %job_id, task = %job.task(), error = %message, "Job failed");
                slot.release(job_id).await
            }
        };

        if let Err(e) = released {
            error!(job_id = %job_id, error = %e, "Failed to clear pending job");
        }
    }

    async fn record_failure(&self, job: &Job, category: &str) {
        let message = failure_message(job, category);
        if let Err(e) = self.jobs.transition(&job.id(), Transition::Fail(message)).await {
            error!(job_id = %job.id(), error = %e, "Failed to record job failure");
        }
    }
}

/// Job error text exposed to clients.
fn failure_message(job: &Job, category: &str) -> String {
    format!("{} failed: {category}", job.task())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use jobplane_id::RuleId;
    use jobplane_jobs::JobFilter;

    use super::*;
    use crate::actuation::{ActuationError, SimulatedActuator};
    use crate::model::{Machine, MachineState, Rule};
    use crate::store::MemoryJobStore;

    /// Store that refuses to start jobs, or to record their success.
    struct Refusing {
        inner: MemoryJobStore,
        refuse: fn(&Transition) -> bool,
    }

    #[async_trait]
    impl JobStore for Refusing {
        async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(job_id).await
        }

        async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list(filter).await
        }

        async fn transition(
            &self,
            job_id: &JobId,
            transition: Transition,
        ) -> Result<Job, JobStoreError> {
            if (self.refuse)(&transition) {
                return Err(JobStoreError::Unavailable("database is read-only".into()));
            }
            self.inner.transition(job_id, transition).await
        }
    }

    fn refusing_executor(
        refuse: fn(&Transition) -> bool,
    ) -> (JobExecutor, Arc<dyn JobStore>, Arc<Resources>) {
        let jobs: Arc<dyn JobStore> = Arc::new(Refusing {
            inner: MemoryJobStore::new(),
            refuse,
        });
        let resources = Arc::new(Resources::new());
        let executor = JobExecutor::new(
            jobs.clone(),
            resources.clone(),
            instant(),
            ExecutorConfig::default(),
        );
        (executor, jobs, resources)
    }

    struct Rejecting;

    #[async_trait]
    impl Actuator for Rejecting {
        async fn actuate(&self, _job: &Job) -> Result<(), ActuationError> {
            Err(ActuationError::Rejected("fabric said no: 0xdeadbeef".into()))
        }
    }

    fn executor(actuator: Arc<dyn Actuator>) -> (JobExecutor, Arc<dyn JobStore>, Arc<Resources>) {
        let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let resources = Arc::new(Resources::new());
        let executor = JobExecutor::new(
            jobs.clone(),
            resources.clone(),
            actuator,
            ExecutorConfig::default(),
        );
        (executor, jobs, resources)
    }

    fn instant() -> Arc<dyn Actuator> {
        Arc::new(SimulatedActuator::new(Duration::ZERO))
    }

    const TEXT: &str = "FROM any TO all vms ALLOW tcp port 22";

    #[tokio::test]
    async fn test_create_commits_rule() {
        let (executor, jobs, resources) = executor(instant());
        let id = RuleId::new();
        let job = Job::new(JobAction::CreateRule { rule: TEXT.into() }, id);
        resources.rules.insert_reserved(id, job.id()).await.unwrap();
        jobs.insert(job.clone()).await.unwrap();

        executor.execute(job.id()).await;

        let stored = jobs.get(&job.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Succeeded);
        let rule = resources.rules.get(&id).await.unwrap();
        assert_eq!(rule, Rule::created(id, TEXT, job.created_at()));
        assert!(!rule.enabled);
        assert_eq!(resources.rules.pending_job(&id).await, None);
    }

    #[tokio::test]
    async fn test_failure_is_sanitized_and_releases() {
        let (executor, jobs, resources) = executor(Arc::new(Rejecting));
        let rule = Rule::new(RuleId::new(), TEXT);
        let id = rule.id;
        resources.rules.insert(id, rule.clone()).await.unwrap();

        let job = Job::new(JobAction::DeleteRule, id);
        resources.rules.reserve(&id, job.id()).await.unwrap();
        jobs.insert(job.clone()).await.unwrap();

        executor.execute(job.id()).await;

        let stored = jobs.get(&job.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Failed);
        assert_eq!(stored.error(), Some("delete-rule failed: rejected by backend"));
        assert_eq!(resources.rules.get(&id).await, Some(rule));
        assert_eq!(resources.rules.pending_job(&id).await, None);
    }

    #[tokio::test]
    async fn test_failed_create_discards_provisional_rule() {
        let (executor, jobs, resources) = executor(Arc::new(Rejecting));
        let id = RuleId::new();
        let job = Job::new(JobAction::CreateRule { rule: TEXT.into() }, id);
        resources.rules.insert_reserved(id, job.id()).await.unwrap();
        jobs.insert(job.clone()).await.unwrap();

        executor.execute(job.id()).await;

        assert!(resources.rules.get(&id).await.is_none());
        assert!(resources.rules.list().await.is_empty());
        assert!(matches!(
            resources.rules.reserve(&id, JobId::new()).await,
            Err(crate::resources::ResourceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreserved_target_fails_job() {
        let (executor, jobs, resources) = executor(instant());
        let machine = Machine::new("web-1");
        let id = machine.id;
        resources.machines.insert(id, machine).await.unwrap();

        let job = Job::new(JobAction::StopVm, id);
        jobs.insert(job.clone()).await.unwrap();

        executor.execute(job.id()).await;

        let stored = jobs.get(&job.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Failed);
        assert_eq!(
            resources.machines.get(&id).await.unwrap().state,
            MachineState::Running
        );
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_shutdown() {
        let (executor, jobs, resources) = executor(instant());
        let (queue, receiver) = job_queue();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let machine = Machine::new("web-1");
        let id = machine.id;
        resources.machines.insert(id, machine).await.unwrap();
        let job = Job::new(JobAction::StopVm, id);
        resources.machines.reserve(&id, job.id()).await.unwrap();
        jobs.insert(job.clone()).await.unwrap();

        let handle = tokio::spawn({
            let executor = executor.clone();
            async move { executor.run(receiver, shutdown_rx).await }
        });
        queue.enqueue(job.id()).unwrap();

        for _ in 0..100 {
            if jobs.get(&job.id()).await.unwrap().unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            resources.machines.get(&id).await.unwrap().state,
            MachineState::Stopped
        );

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(queue.is_closed());
        assert!(queue.enqueue(JobId::new()).is_err());
    }

    #[tokio::test]
    async fn test_unstartable_job_releases_target() {
        let (executor, jobs, resources) =
            refusing_executor(|t| matches!(t, Transition::Start));
        let machine = Machine::new("web-1");
        let id = machine.id;
        resources.machines.insert(id, machine).await.unwrap();

        let job = Job::new(JobAction::StopVm, id);
        resources.machines.reserve(&id, job.id()).await.unwrap();
        jobs.insert(job.clone()).await.unwrap();

        executor.execute(job.id()).await;

        assert_eq!(resources.machines.pending_job(&id).await, None);
        assert_eq!(
            resources.machines.get(&id).await.unwrap().state,
            MachineState::Running
        );
        let next = JobId::new();
        assert!(resources.machines.reserve(&id, next).await.is_ok());
    }

    #[tokio::test]
    async fn test_second_execution_leaves_reservation_alone() {
        let (executor, jobs, resources) = executor(instant());
        let machine = Machine::new("web-1");
        let id = machine.id;
        resources.machines.insert(id, machine).await.unwrap();

        let job = Job::new(JobAction::StopVm, id);
        resources.machines.reserve(&id, job.id()).await.unwrap();
        jobs.insert(job.clone()).await.unwrap();
        jobs.transition(&job.id(), Transition::Start).await.unwrap();

        executor.execute(job.id()).await;

        assert_eq!(resources.machines.pending_job(&id).await, Some(job.id()));
        let stored = jobs.get(&job.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Running);
    }

    #[tokio::test]
    async fn test_unstartable_create_discards_provisional_rule() {
        let (executor, jobs, resources) =
            refusing_executor(|t| matches!(t, Transition::Start));
        let id = RuleId::new();
        let job = Job::new(JobAction::CreateRule { rule: TEXT.into() }, id);
        resources.rules.insert_reserved(id, job.id()).await.unwrap();
        jobs.insert(job.clone()).await.unwrap();

        executor.execute(job.id()).await;

        assert!(resources.rules.get(&id).await.is_none());
        assert_eq!(resources.rules.pending_job(&id).await, None);
    }

    #[tokio::test]
    async fn test_unrecorded_success_fails_job_and_releases() {
        let (executor, jobs, resources) =
            refusing_executor(|t| matches!(t, Transition::Succeed));
        let machine = Machine::new("web-1");
        let id = machine.id;
        resources.machines.insert(id, machine).await.unwrap();

        let job = Job::new(JobAction::StopVm, id);
        resources.machines.reserve(&id, job.id()).await.unwrap();
        jobs.insert(job.clone()).await.unwrap();

        executor.execute(job.id()).await;

        let stored = jobs.get(&job.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Failed);
        assert_eq!(stored.error(), Some("stop-vm failed: internal error"));
        assert_eq!(resources.machines.pending_job(&id).await, None);
        assert_eq!(
            resources.machines.get(&id).await.unwrap().state,
            MachineState::Running
        );
    }
}
