//! Job records and their lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use jobplane_id::{JobId, MachineId, RuleId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a string does not name a known enum value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Illegal job state transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("job {job_id}: invalid transition from {from} to {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `succeeded` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running) | (Self::Running, Self::Succeeded | Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Task and action
// =============================================================================

/// The kind of work a job performs, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobTask {
    CreateRule,
    UpdateRule,
    EnableRule,
    DisableRule,
    DeleteRule,
    RebootVm,
    StartVm,
    StopVm,
}

impl JobTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateRule => "create-rule",
            Self::UpdateRule => "update-rule",
            Self::EnableRule => "enable-rule",
            Self::DisableRule => "disable-rule",
            Self::DeleteRule => "delete-rule",
            Self::RebootVm => "reboot-vm",
            Self::StartVm => "start-vm",
            Self::StopVm => "stop-vm",
        }
    }
}

impl fmt::Display for JobTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobTask {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let task = match s {
            "create-rule" => Self::CreateRule,
            "update-rule" => Self::UpdateRule,
            "enable-rule" => Self::EnableRule,
            "disable-rule" => Self::DisableRule,
            "delete-rule" => Self::DeleteRule,
            // `reboot` is the machine action name clients already filter on.
            "reboot-vm" | "reboot" => Self::RebootVm,
            "start-vm" | "start" => Self::StartVm,
            "stop-vm" | "stop" => Self::StopVm,
            other => {
                return Err(ParseEnumError {
                    kind: "job task",
                    value: other.to_string(),
                })
            }
        };
        Ok(task)
    }
}

/// What a job does, including the payload it needs to apply on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "kebab-case")]
pub enum JobAction {
    CreateRule { rule: String },
    UpdateRule { rule: String },
    EnableRule,
    DisableRule,
    DeleteRule,
    RebootVm,
    StartVm,
    StopVm,
}

impl JobAction {
    pub fn task(&self) -> JobTask {
        match self {
            Self::CreateRule { .. } => JobTask::CreateRule,
            Self::UpdateRule { .. } => JobTask::UpdateRule,
            Self::EnableRule => JobTask::EnableRule,
            Self::DisableRule => JobTask::DisableRule,
            Self::DeleteRule => JobTask::DeleteRule,
            Self::RebootVm => JobTask::RebootVm,
            Self::StartVm => JobTask::StartVm,
            Self::StopVm => JobTask::StopVm,
        }
    }
}

// =============================================================================
// Target
// =============================================================================

/// The resource a job mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum JobTarget {
    Rule(RuleId),
    Machine(MachineId),
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(id) => id.fmt(f),
            Self::Machine(id) => id.fmt(f),
        }
    }
}

impl FromStr for JobTarget {
    type Err = ParseEnumError;

    /// Parses a bare resource id; the prefix decides the kind.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id) = RuleId::parse(s) {
            return Ok(Self::Rule(id));
        }
        if let Ok(id) = MachineId::parse(s) {
            return Ok(Self::Machine(id));
        }
        Err(ParseEnumError {
            kind: "job target",
            value: s.to_string(),
        })
    }
}

impl From<RuleId> for JobTarget {
    fn from(id: RuleId) -> Self {
        Self::Rule(id)
    }
}

impl From<MachineId> for JobTarget {
    fn from(id: MachineId) -> Self {
        Self::Machine(id)
    }
}

// =============================================================================
// Job
// =============================================================================

/// Durable record of one asynchronous mutating operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    #[serde(flatten)]
    action: JobAction,
    target: JobTarget,
    status: JobStatus,
    created_at: DateTime<Utc>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    error: Option<String>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(action: JobAction, target: impl Into<JobTarget>) -> Self {
        Self {
            id: JobId::new(),
            action,
            target: target.into(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn action(&self) -> &JobAction {
        &self.action
    }

    pub fn task(&self) -> JobTask {
        self.action.task()
    }

    pub fn target(&self) -> JobTarget {
        self.target
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Failure detail; set iff the job failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `queued -> running`
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.advance(JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> succeeded`
    pub fn succeed(&mut self) -> Result<(), TransitionError> {
        self.advance(JobStatus::Succeeded)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> failed`, recording `error`.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(JobStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        Ok(())
    }

    fn advance(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

// =============================================================================
// Filter
// =============================================================================

/// Criteria for listing jobs. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub target: Option<JobTarget>,
    pub task: Option<JobTask>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn with_target(mut self, target: impl Into<JobTarget>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_task(mut self, task: JobTask) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.target.is_none_or(|t| t == job.target)
            && self.task.is_none_or(|t| t == job.task())
            && self.status.is_none_or(|s| s == job.status)
    }
}
