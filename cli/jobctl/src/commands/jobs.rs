//! Job commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use jobplane_id::{JobId, MachineId};
use jobplane_jobs::{wait_for_job, Job, JobStatus, JobTarget, JobTask};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_output, print_single, print_success};

use super::{CommandContext, WaitArgs};

/// Job commands.
#[derive(Debug, Args)]
pub struct JobsCommand {
    #[command(subcommand)]
    command: JobsSubcommand,
}

#[derive(Debug, Subcommand)]
enum JobsSubcommand {
    /// List jobs, optionally filtered.
    List(ListJobsArgs),

    /// Get job details.
    Get(GetJobArgs),

    /// Wait until a job completes.
    Wait(WaitJobArgs),
}

#[derive(Debug, Args)]
struct ListJobsArgs {
    /// Only jobs targeting this rule or machine ID.
    #[arg(long)]
    target: Option<JobTarget>,

    /// Only jobs targeting this machine.
    #[arg(long)]
    vm: Option<MachineId>,

    /// Only jobs of this task (e.g. enable-rule, reboot).
    #[arg(long)]
    task: Option<JobTask>,

    /// Only jobs in this status.
    #[arg(long)]
    status: Option<JobStatus>,
}

impl ListJobsArgs {
    fn query(&self) -> String {
        let mut params = Vec::new();
        if let Some(target) = &self.target {
            params.push(format!("target={target}"));
        }
        if let Some(vm) = &self.vm {
            params.push(format!("vm_uuid={vm}"));
        }
        if let Some(task) = &self.task {
            params.push(format!("task={task}"));
        }
        if let Some(status) = &self.status {
            params.push(format!("status={status}"));
        }
        if params.is_empty() {
            String::new()
        } else {
            format!("?{}", params.join("&"))
        }
    }
}

#[derive(Debug, Args)]
struct GetJobArgs {
    /// Job ID.
    job: JobId,
}

#[derive(Debug, Args)]
struct WaitJobArgs {
    /// Job ID.
    job: JobId,

    #[command(flatten)]
    wait: WaitArgs,
}

impl JobsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            JobsSubcommand::List(args) => list_jobs(ctx, args).await,
            JobsSubcommand::Get(args) => get_job(ctx, args).await,
            JobsSubcommand::Wait(args) => wait_job(ctx, args).await,
        }
    }
}

/// Table row for a job.
#[derive(Debug, Serialize, Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "Task")]
    task: String,

    #[tabled(rename = "Target")]
    target: String,

    #[tabled(rename = "Status")]
    status: String,

    #[tabled(rename = "Created")]
    created_at: String,

    #[tabled(rename = "Error")]
    error: String,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id().to_string(),
            task: job.task().to_string(),
            target: job.target().to_string(),
            status: job.status().to_string(),
            created_at: job.created_at().to_rfc3339(),
            error: job.error().unwrap_or("-").to_string(),
        }
    }
}

async fn list_jobs(ctx: CommandContext, args: ListJobsArgs) -> Result<()> {
    let jobs: Vec<Job> = ctx.client.get(&format!("/my/jobs{}", args.query())).await?;

    match ctx.format {
        crate::output::OutputFormat::Table => {
            let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
            print_output(&rows, ctx.format);
        }
        crate::output::OutputFormat::Json => print_single(&jobs, ctx.format),
    }
    Ok(())
}

async fn get_job(ctx: CommandContext, args: GetJobArgs) -> Result<()> {
    let job: Job = ctx.client.get(&format!("/my/jobs/{}", args.job)).await?;
    print_single(&job, ctx.format);
    Ok(())
}

async fn wait_job(ctx: CommandContext, args: WaitJobArgs) -> Result<()> {
    let job = wait_for_job(&ctx.client, &args.job, &args.wait.poll_config())
        .await
        .map_err(super::poll_failure)?;

    match ctx.format {
        crate::output::OutputFormat::Table => {
            print_success(&format!("Job {} {}", job.id(), job.status()))
        }
        crate::output::OutputFormat::Json => print_single(&job, ctx.format),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_string_from_filters() {
        let vm = MachineId::new();
        let args = ListJobsArgs {
            target: None,
            vm: Some(vm),
            task: Some(JobTask::RebootVm),
            status: Some(JobStatus::Running),
        };
        assert_eq!(
            args.query(),
            format!("?vm_uuid={vm}&task=reboot-vm&status=running")
        );
    }

    #[test]
    fn test_empty_query() {
        let args = ListJobsArgs {
            target: None,
            vm: None,
            task: None,
            status: None,
        };
        assert_eq!(args.query(), "");
    }
}
