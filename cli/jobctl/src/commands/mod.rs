//! CLI commands.

mod jobs;
mod machines;
mod rules;

use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use jobplane_id::JobId;
use jobplane_jobs::{wait_for_job, PollConfig, PollError};

use crate::client::ApiClient;
use crate::error::CliError;
use crate::output::{print_receipt, OutputFormat, Receipt, ReceiptNextStep};

/// jobctl - manage firewall rules and machines through the jobplane control plane.
#[derive(Debug, Parser)]
#[command(name = "jobctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Control plane base URL.
    #[arg(
        long,
        global = true,
        env = "JOBCTL_API_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    api_url: String,

    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage firewall rules.
    Rules(rules::RulesCommand),

    /// Inspect machines and change their power state.
    Machines(machines::MachinesCommand),

    /// Inspect and wait on jobs.
    Jobs(jobs::JobsCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let format = match self.format.as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        };

        let ctx = CommandContext {
            client: ApiClient::new(&self.api_url)?,
            format,
        };

        match self.command {
            Commands::Rules(cmd) => cmd.run(ctx).await,
            Commands::Machines(cmd) => cmd.run(ctx).await,
            Commands::Jobs(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("jobctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub client: ApiClient,
    pub format: OutputFormat,
}

/// Options for following a job until it completes.
#[derive(Debug, Clone, Args)]
pub struct WaitArgs {
    /// Wait for the job to finish before returning.
    #[arg(long)]
    pub wait: bool,

    /// Give up waiting after this many seconds. The job keeps running.
    #[arg(long, default_value = "600")]
    pub timeout_secs: u64,

    /// Initial delay between polls, in milliseconds.
    #[arg(long, default_value = "250", value_parser = clap::value_parser!(u64).range(1..))]
    pub interval_ms: u64,
}

impl WaitArgs {
    pub fn poll_config(&self) -> PollConfig {
        PollConfig::default()
            .with_interval(Duration::from_millis(self.interval_ms))
            .with_timeout(Duration::from_secs(self.timeout_secs))
    }
}

/// Unwrap client errors so `print_error` can show their hints.
pub(crate) fn poll_failure(err: PollError<CliError>) -> anyhow::Error {
    match err {
        PollError::Source(e) => e.into(),
        other => other.into(),
    }
}

/// A mutation the server accepted, ready to be reported.
pub struct Submitted<'a> {
    pub kind: &'a str,
    pub message: String,
    pub job_id: JobId,
    pub resource: Option<serde_json::Value>,
}

/// Report an accepted mutation, following its job first when `--wait` is set.
pub async fn report(ctx: &CommandContext, wait: &WaitArgs, submitted: Submitted<'_>) -> Result<()> {
    let job_id = submitted.job_id.to_string();

    if !wait.wait {
        let next = [ReceiptNextStep {
            label: "Follow the job",
            cmd: format!("jobctl jobs wait {job_id}"),
        }];
        print_receipt(
            ctx.format,
            Receipt {
                message: format!("{} (job {job_id})", submitted.message),
                status: "accepted",
                kind: submitted.kind,
                job_id,
                resource: submitted.resource,
                next: &next,
            },
        );
        return Ok(());
    }

    let job = wait_for_job(&ctx.client, &submitted.job_id, &wait.poll_config())
        .await
        .map_err(poll_failure)?;

    print_receipt(
        ctx.format,
        Receipt {
            message: format!("{}; job {job_id} {}", submitted.message, job.status()),
            status: job.status().as_str(),
            kind: submitted.kind,
            job_id,
            resource: submitted.resource,
            next: &[],
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_rule_text_may_span_arguments() {
        let cli = Cli::try_parse_from([
            "jobctl", "rules", "create", "FROM", "any", "TO", "all", "vms", "ALLOW", "tcp",
            "port", "22", "--wait",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Rules(_)));
    }

    #[test]
    fn test_wait_defaults() {
        let cli = Cli::try_parse_from(["jobctl", "jobs", "wait", "job_01HV4Z2WQXKJNM8GPQY6VBKC3D"])
            .unwrap();
        assert_eq!(cli.api_url, "http://127.0.0.1:8080");
        assert_eq!(cli.format, "table");
    }

    #[test]
    fn test_poll_config_from_flags() {
        let args = WaitArgs {
            wait: true,
            timeout_secs: 30,
            interval_ms: 100,
        };
        let config = args.poll_config();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.initial_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let err = Cli::try_parse_from([
            "jobctl",
            "jobs",
            "wait",
            "job_01HV4Z2WQXKJNM8GPQY6VBKC3D",
            "--interval-ms",
            "0",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_poll_failure_keeps_client_error_visible() {
        let err = poll_failure(PollError::Source(CliError::Protocol("bad json".into())));
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Protocol(_))
        ));

        let job_id = JobId::new();
        let err = poll_failure(PollError::NotFound(job_id));
        assert!(err.downcast_ref::<PollError<CliError>>().is_some());
    }
}
