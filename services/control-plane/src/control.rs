//! Control API surface.
//!
//! [`ControlPlane`] accepts mutating requests, reserves the target resource,
//! records a queued [`Job`] and hands it to the executor. Reads return
//! committed resource state only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobplane_id::{JobId, MachineId, RuleId};
use jobplane_jobs::{
    wait_for_job, Job, JobAction, JobFilter, JobSource, PollConfig, PollError, TransitionError,
};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::actuation::{Actuator, SimulatedActuator};
use crate::executor::{job_queue, ExecutorConfig, JobExecutor, JobQueue, JobReceiver};
use crate::grammar::{BasicRuleGrammar, GrammarError, ParsedRule, RuleGrammar};
use crate::model::{Machine, MachineAction, Rule};
use crate::resources::{ResourceError, ResourceTable, Resources};
use crate::store::{JobStore, JobStoreError, MemoryJobStore, Transition};

/// Errors surfaced by control operations.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already has a pending job ({pending_job})")]
    Conflict {
        kind: &'static str,
        id: String,
        pending_job: JobId,
    },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("job {job_id} failed: {error}")]
    JobFailed { job_id: JobId, error: String },

    #[error("timed out after {elapsed:?} waiting for job {job_id}")]
    Timeout { job_id: JobId, elapsed: Duration },

    #[error("store error: {0}")]
    Store(String),

    #[error("job executor is not running")]
    QueueClosed,
}

impl From<ResourceError> for ControlError {
    fn from(e: ResourceError) -> Self {
        match e {
            ResourceError::NotFound { kind, id } => Self::NotFound { kind, id },
            ResourceError::Conflict {
                kind,
                id,
                pending_job,
            } => Self::Conflict {
                kind,
                id,
                pending_job,
            },
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<JobStoreError> for ControlError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => Self::NotFound {
                kind: "job",
                id: id.to_string(),
            },
            JobStoreError::Transition(e) => Self::InvalidTransition(e),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<GrammarError> for ControlError {
    fn from(e: GrammarError) -> Self {
        Self::Validation(format!("invalid rule: {e}"))
    }
}

/// A mutating request that was accepted: the resource as visible now, and
/// the job that will apply the change.
#[derive(Debug, Clone)]
pub struct Accepted<T> {
    pub resource: T,
    pub job: Job,
}

/// Builder for [`ControlPlane`].
pub struct ControlPlaneBuilder {
    jobs: Arc<dyn JobStore>,
    resources: Arc<Resources>,
    grammar: Arc<dyn RuleGrammar>,
    actuator: Arc<dyn Actuator>,
    executor: ExecutorConfig,
}

impl ControlPlaneBuilder {
    pub fn job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn grammar(mut self, grammar: Arc<dyn RuleGrammar>) -> Self {
        self.grammar = grammar;
        self
    }

    pub fn actuator(mut self, actuator: Arc<dyn Actuator>) -> Self {
        self.actuator = actuator;
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    /// Build the control surface and the executor that serves its queue.
    ///
    /// The caller must run the executor with the returned receiver.
    pub fn build(self) -> (ControlPlane, JobExecutor, JobReceiver) {
        let (queue, receiver) = job_queue();
        let executor = JobExecutor::new(
            self.jobs.clone(),
            self.resources.clone(),
            self.actuator,
            self.executor,
        );
        let control = ControlPlane {
            inner: Arc::new(ControlPlaneInner {
                jobs: self.jobs,
                resources: self.resources,
                grammar: self.grammar,
                queue,
            }),
        };
        (control, executor, receiver)
    }
}

/// The control plane service. Cheap to clone.
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<ControlPlaneInner>,
}

struct ControlPlaneInner {
    jobs: Arc<dyn JobStore>,
    resources: Arc<Resources>,
    grammar: Arc<dyn RuleGrammar>,
    queue: JobQueue,
}

impl ControlPlane {
    pub fn builder() -> ControlPlaneBuilder {
        ControlPlaneBuilder {
            jobs: Arc::new(MemoryJobStore::new()),
            resources: Arc::new(Resources::new()),
            grammar: Arc::new(BasicRuleGrammar),
            actuator: Arc::new(SimulatedActuator::new(Duration::ZERO)),
            executor: ExecutorConfig::default(),
        }
    }

    // =========================================================================
    // Firewall rules
    // =========================================================================

    /// Committed rules in creation order.
    pub async fn list_rules(&self) -> Vec<Rule> {
        self.inner.resources.rules.list().await
    }

    pub async fn get_rule(&self, id: &RuleId) -> Result<Rule, ControlError> {
        self.inner
            .resources
            .rules
            .get(id)
            .await
            .ok_or_else(|| not_found("rule", id))
    }

    /// Validate `text` and accept a job creating a disabled rule.
    ///
    /// The returned rule is what will be committed; it is not readable until
    /// the job succeeds.
    pub async fn create_rule(&self, text: &str) -> Result<Accepted<Rule>, ControlError> {
        let text = text.trim();
        self.inner.grammar.parse(text)?;

        let id = RuleId::new();
        let job = Job::new(
            JobAction::CreateRule {
                rule: text.to_string(),
            },
            id,
        );
        let rules = &self.inner.resources.rules;
        rules.insert_reserved(id, job.id()).await?;
        let job = self.accept(rules, &id, job).await?;

        Ok(Accepted {
            resource: Rule::created(id, text, job.created_at()),
            job,
        })
    }

    pub async fn update_rule(&self, id: &RuleId, text: &str) -> Result<Accepted<Rule>, ControlError> {
        let text = text.trim();
        self.inner.grammar.parse(text)?;
        self.mutate_rule(
            id,
            JobAction::UpdateRule {
                rule: text.to_string(),
            },
        )
        .await
    }

    pub async fn enable_rule(&self, id: &RuleId) -> Result<Accepted<Rule>, ControlError> {
        self.mutate_rule(id, JobAction::EnableRule).await
    }

    pub async fn disable_rule(&self, id: &RuleId) -> Result<Accepted<Rule>, ControlError> {
        self.mutate_rule(id, JobAction::DisableRule).await
    }

    pub async fn delete_rule(&self, id: &RuleId) -> Result<Accepted<Rule>, ControlError> {
        self.mutate_rule(id, JobAction::DeleteRule).await
    }

    async fn mutate_rule(
        &self,
        id: &RuleId,
        action: JobAction,
    ) -> Result<Accepted<Rule>, ControlError> {
        let rules = &self.inner.resources.rules;
        self.submit(rules, id, Job::new(action, *id)).await
    }

    /// Machines the committed rule applies to.
    pub async fn list_rule_machines(&self, id: &RuleId) -> Result<Vec<Machine>, ControlError> {
        let rule = self.get_rule(id).await?;
        let machines = self.inner.resources.machines.list().await;
        let Some(parsed) = self.parse_committed(&rule) else {
            return Ok(Vec::new());
        };
        Ok(machines
            .into_iter()
            .filter(|m| parsed.affects(&m.id))
            .collect())
    }

    // =========================================================================
    // Machines
    // =========================================================================

    pub async fn list_machines(&self) -> Vec<Machine> {
        self.inner.resources.machines.list().await
    }

    pub async fn get_machine(&self, id: &MachineId) -> Result<Machine, ControlError> {
        self.inner
            .resources
            .machines
            .get(id)
            .await
            .ok_or_else(|| not_found("machine", id))
    }

    /// Register an existing machine. Machines are provisioned elsewhere; this
    /// only makes one known to the control plane.
    pub async fn register_machine(&self, name: &str) -> Result<Machine, ControlError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ControlError::Validation("machine name cannot be empty".into()));
        }
        let machine = Machine::new(name);
        self.inner
            .resources
            .machines
            .insert(machine.id, machine.clone())
            .await?;
        info!(machine_id = %machine.id, name = %machine.name, "Machine registered");
        Ok(machine)
    }

    /// Committed rules that apply to the machine.
    pub async fn list_machine_rules(&self, id: &MachineId) -> Result<Vec<Rule>, ControlError> {
        self.get_machine(id).await?;
        let rules = self.inner.resources.rules.list().await;
        Ok(rules
            .into_iter()
            .filter(|rule| self.parse_committed(rule).is_some_and(|p| p.affects(id)))
            .collect())
    }

    /// Accept a power action (reboot, start, stop) on a machine.
    pub async fn machine_action(
        &self,
        id: &MachineId,
        action: MachineAction,
    ) -> Result<Accepted<Machine>, ControlError> {
        let machines = &self.inner.resources.machines;
        self.submit(machines, id, Job::new(action.job_action(), *id))
            .await
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub async fn get_job(&self, id: &JobId) -> Result<Job, ControlError> {
        self.inner
            .jobs
            .get(id)
            .await?
            .ok_or_else(|| not_found("job", id))
    }

    /// Jobs matching `filter`, in creation order.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, ControlError> {
        Ok(self.inner.jobs.list(filter).await?)
    }

    /// Wait until the job is terminal or `timeout` elapses.
    ///
    /// Timing out leaves the job untouched.
    pub async fn wait_job(&self, id: &JobId, timeout: Duration) -> Result<Job, ControlError> {
        let config = PollConfig {
            initial_interval: Duration::from_millis(25),
            max_interval: Duration::from_millis(500),
            multiplier: 2.0,
            timeout,
        };
        wait_for_job(self, id, &config).await.map_err(|e| match e {
            PollError::Timeout {
                job_id, elapsed, ..
            } => ControlError::Timeout { job_id, elapsed },
            PollError::JobFailed(job) => ControlError::JobFailed {
                job_id: job.id(),
                error: job.error().unwrap_or("unknown error").to_string(),
            },
            PollError::NotFound(id) => not_found("job", &id),
            PollError::Source(e) => e,
        })
    }

    /// Readiness of the job store and executor queue.
    pub async fn health_check(&self) -> Result<(), ControlError> {
        self.inner.jobs.health_check().await?;
        if self.inner.queue.is_closed() {
            return Err(ControlError::QueueClosed);
        }
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn parse_committed(&self, rule: &Rule) -> Option<ParsedRule> {
        match self.inner.grammar.parse(&rule.rule) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "Committed rule no longer parses");
                None
            }
        }
    }

    /// Reserve an existing resource for `job`, then accept the job.
    async fn submit<K, T>(
        &self,
        table: &ResourceTable<K, T>,
        id: &K,
        job: Job,
    ) -> Result<Accepted<T>, ControlError>
    where
        K: Clone + Eq + std::hash::Hash + std::fmt::Display + Send + Sync,
        T: Clone + Send + Sync,
    {
        let resource = table.reserve(id, job.id()).await?;
        let job = self.accept(table, id, job).await?;
        Ok(Accepted { resource, job })
    }

    /// Record a job whose target is already reserved, and enqueue it.
    /// Any failure releases the reservation.
    async fn accept<K, T>(
        &self,
        table: &ResourceTable<K, T>,
        id: &K,
        job: Job,
    ) -> Result<Job, ControlError>
    where
        K: Clone + Eq + std::hash::Hash + std::fmt::Display + Send + Sync,
        T: Clone + Send + Sync,
    {
        let job_id = job.id();

        if let Err(e) = self.inner.jobs.insert(job.clone()).await {
            error!(job_id = %job_id, error = %e, "Failed to record job");
            release(table, id, job_id).await;
            return Err(e.into());
        }

        if self.inner.queue.enqueue(job_id).is_err() {
            error!(job_id = %job_id, "Job executor is not running");
            let message = format!("{} failed: executor unavailable", job.task());
            for step in [Transition::Start, Transition::Fail(message)] {
                if let Err(e) = self.inner.jobs.transition(&job_id, step).await {
                    error!(job_id = %job_id, error = %e, "Failed to fail unqueued job");
                }
            }
            release(table, id, job_id).await;
            return Err(ControlError::QueueClosed);
        }

        info!(job_id = %job_id, task = %job.task(), target = %job.target(), "Job accepted");
        Ok(job)
    }
}

async fn release<K, T>(table: &ResourceTable<K, T>, id: &K, job_id: JobId)
where
    K: Clone + Eq + std::hash::Hash + std::fmt::Display + Send + Sync,
    T: Clone + Send + Sync,
{
    if let Err(e) = table.release(id, job_id).await {
        error!(job_id = %job_id, error = %e, "Failed to release reservation");
    }
}

fn not_found(kind: &'static str, id: &impl std::fmt::Display) -> ControlError {
    ControlError::NotFound {
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl JobSource for ControlPlane {
    type Error = ControlError;

    async fn fetch_job(&self, job_id: &JobId) -> Result<Option<Job>, Self::Error> {
        Ok(self.inner.jobs.get(job_id).await?)
    }
}
