//! Managed resource records and how successful jobs change them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use jobplane_id::{MachineId, RuleId};
use jobplane_jobs::{JobAction, JobTask};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A firewall rule as committed by its last successful job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub rule: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// A freshly created rule. Rules always start disabled.
    pub fn new(id: RuleId, rule: impl Into<String>) -> Self {
        Self::created(id, rule, Utc::now())
    }

    /// A rule created at `at`.
    pub fn created(id: RuleId, rule: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id,
            rule: rule.into(),
            enabled: false,
            created_at: at,
            updated_at: at,
        }
    }
}

/// Power state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Running,
    Stopped,
}

/// A virtual machine. Machines are registered out-of-band; jobs only change
/// their power state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub state: MachineState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_booted_at: Option<DateTime<Utc>>,
}

impl Machine {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: MachineId::new(),
            name: name.into(),
            state: MachineState::Running,
            created_at: now,
            last_booted_at: Some(now),
        }
    }
}

/// Action requested through `POST /my/machines/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineAction {
    Reboot,
    Start,
    Stop,
}

impl MachineAction {
    pub fn job_action(&self) -> JobAction {
        match self {
            Self::Reboot => JobAction::RebootVm,
            Self::Start => JobAction::StartVm,
            Self::Stop => JobAction::StopVm,
        }
    }
}

impl FromStr for MachineAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reboot" => Ok(Self::Reboot),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            other => Err(format!(
                "unsupported machine action '{other}' (expected reboot, start, or stop)"
            )),
        }
    }
}

impl fmt::Display for MachineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reboot => "reboot",
            Self::Start => "start",
            Self::Stop => "stop",
        })
    }
}

/// A job task that cannot be applied to the kind of resource it targets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{task} cannot be applied to a {resource}")]
pub struct UnsupportedTask {
    pub task: JobTask,
    pub resource: &'static str,
}

/// Compute a rule's committed state after `action` succeeds.
///
/// `None` means the rule no longer exists. A created rule is stamped with
/// `accepted_at`, the time its job was accepted.
pub fn next_rule(
    id: RuleId,
    current: Option<Rule>,
    action: &JobAction,
    accepted_at: DateTime<Utc>,
) -> Result<Option<Rule>, UnsupportedTask> {
    let now = Utc::now();
    let next = match action {
        JobAction::CreateRule { rule } => Some(Rule::created(id, rule.clone(), accepted_at)),
        JobAction::UpdateRule { rule } => current.map(|mut r| {
            r.rule = rule.clone();
            r.updated_at = now;
            r
        }),
        JobAction::EnableRule | JobAction::DisableRule => {
            let enabled = matches!(action, JobAction::EnableRule);
            current.map(|mut r| {
                r.enabled = enabled;
                r.updated_at = now;
                r
            })
        }
        JobAction::DeleteRule => None,
        JobAction::RebootVm | JobAction::StartVm | JobAction::StopVm => {
            return Err(UnsupportedTask {
                task: action.task(),
                resource: "rule",
            })
        }
    };
    Ok(next)
}

/// Compute a machine's committed state after `action` succeeds.
pub fn next_machine(
    current: Option<Machine>,
    action: &JobAction,
) -> Result<Option<Machine>, UnsupportedTask> {
    let now = Utc::now();
    let next = match action {
        JobAction::RebootVm | JobAction::StartVm => current.map(|mut m| {
            m.state = MachineState::Running;
            m.last_booted_at = Some(now);
            m
        }),
        JobAction::StopVm => current.map(|mut m| {
            m.state = MachineState::Stopped;
            m
        }),
        _ => {
            return Err(UnsupportedTask {
                task: action.task(),
                resource: "machine",
            })
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "FROM any TO all vms ALLOW tcp port 22";

    #[test]
    fn test_create_yields_disabled_rule() {
        let id = RuleId::new();
        let accepted_at = Utc::now() - chrono::Duration::seconds(30);
        let rule = next_rule(id, None, &JobAction::CreateRule { rule: TEXT.into() }, accepted_at)
            .unwrap()
            .unwrap();
        assert_eq!(rule, Rule::created(id, TEXT, accepted_at));
        assert!(!rule.enabled);
        assert_eq!(rule.created_at, accepted_at);
        assert_eq!(rule.updated_at, accepted_at);
    }

    #[test]
    fn test_enable_disable_update_delete() {
        let id = RuleId::new();
        let rule = Rule::new(id, TEXT);

        let enabled = next_rule(id, Some(rule.clone()), &JobAction::EnableRule, Utc::now())
            .unwrap()
            .unwrap();
        assert!(enabled.enabled);

        let disabled = next_rule(id, Some(enabled), &JobAction::DisableRule, Utc::now())
            .unwrap()
            .unwrap();
        assert!(!disabled.enabled);

        let updated = next_rule(
            id,
            Some(disabled),
            &JobAction::UpdateRule {
                rule: "FROM any TO all vms BLOCK udp port 53".into(),
            },
            Utc::now(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(updated.rule, "FROM any TO all vms BLOCK udp port 53");
        assert_eq!(updated.created_at, rule.created_at);

        assert_eq!(
            next_rule(id, Some(updated), &JobAction::DeleteRule, Utc::now()),
            Ok(None)
        );
    }

    #[test]
    fn test_machine_tasks_do_not_apply_to_rules() {
        let err = next_rule(RuleId::new(), None, &JobAction::RebootVm, Utc::now()).unwrap_err();
        assert_eq!(err.task, JobTask::RebootVm);
        assert!(next_machine(None, &JobAction::DeleteRule).is_err());
    }

    #[test]
    fn test_machine_power_transitions() {
        let machine = Machine::new("web-1");
        let stopped = next_machine(Some(machine), &JobAction::StopVm)
            .unwrap()
            .unwrap();
        assert_eq!(stopped.state, MachineState::Stopped);

        let started = next_machine(Some(stopped.clone()), &JobAction::StartVm)
            .unwrap()
            .unwrap();
        assert_eq!(started.state, MachineState::Running);
        assert!(started.last_booted_at >= stopped.last_booted_at);

        let rebooted = next_machine(Some(started), &JobAction::RebootVm)
            .unwrap()
            .unwrap();
        assert_eq!(rebooted.state, MachineState::Running);
    }

    #[test]
    fn test_machine_action_parsing() {
        assert_eq!("reboot".parse::<MachineAction>(), Ok(MachineAction::Reboot));
        assert_eq!(MachineAction::Stop.job_action(), JobAction::StopVm);
        assert!("hibernate".parse::<MachineAction>().is_err());
    }
}
