//! Machine commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use jobplane_jobs::Job;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::output::{print_output, print_single};

use super::rules::RuleResponse;
use super::{report, CommandContext, Submitted, WaitArgs};

/// Machine commands.
#[derive(Debug, Args)]
pub struct MachinesCommand {
    #[command(subcommand)]
    command: MachinesSubcommand,
}

#[derive(Debug, Subcommand)]
enum MachinesSubcommand {
    /// List machines.
    List,

    /// Get machine details.
    Get(MachineArgs),

    /// Reboot a running machine.
    Reboot(MachineJobArgs),

    /// Start a stopped machine.
    Start(MachineJobArgs),

    /// Stop a running machine.
    Stop(MachineJobArgs),

    /// List the firewall rules that affect a machine.
    Rules(MachineArgs),
}

#[derive(Debug, Args)]
struct MachineArgs {
    /// Machine ID.
    machine: String,
}

#[derive(Debug, Args)]
struct MachineJobArgs {
    /// Machine ID.
    machine: String,

    #[command(flatten)]
    wait: WaitArgs,
}

impl MachinesCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            MachinesSubcommand::List => list_machines(ctx).await,
            MachinesSubcommand::Get(args) => get_machine(ctx, args).await,
            MachinesSubcommand::Reboot(args) => machine_action(ctx, args, "reboot").await,
            MachinesSubcommand::Start(args) => machine_action(ctx, args, "start").await,
            MachinesSubcommand::Stop(args) => machine_action(ctx, args, "stop").await,
            MachinesSubcommand::Rules(args) => machine_rules(ctx, args).await,
        }
    }
}

/// Machine response from API.
#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
pub(super) struct MachineResponse {
    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Last boot", display = "display_option")]
    #[serde(default)]
    last_booted_at: Option<String>,

    #[tabled(rename = "Created")]
    created_at: String,
}

fn display_option(opt: &Option<String>) -> String {
    opt.as_deref().unwrap_or("-").to_string()
}

#[derive(Debug, Serialize)]
struct MachineActionRequest<'a> {
    action: &'a str,
}

async fn list_machines(ctx: CommandContext) -> Result<()> {
    let machines: Vec<MachineResponse> = ctx.client.get("/my/machines").await?;
    print_output(&machines, ctx.format);
    Ok(())
}

async fn get_machine(ctx: CommandContext, args: MachineArgs) -> Result<()> {
    let machine: MachineResponse = ctx
        .client
        .get(&format!("/my/machines/{}", args.machine))
        .await?;
    print_single(&machine, ctx.format);
    Ok(())
}

async fn machine_action(ctx: CommandContext, args: MachineJobArgs, action: &str) -> Result<()> {
    let accepted = ctx
        .client
        .post::<Job, _>(
            &format!("/my/machines/{}", args.machine),
            &MachineActionRequest { action },
        )
        .await?;

    let kind = format!("machines.{action}");
    report(
        &ctx,
        &args.wait,
        Submitted {
            kind: &kind,
            message: format!("Request to {action} machine {} accepted", args.machine),
            job_id: accepted.job_id,
            resource: None,
        },
    )
    .await
}

async fn machine_rules(ctx: CommandContext, args: MachineArgs) -> Result<()> {
    let rules: Vec<RuleResponse> = ctx
        .client
        .get(&format!("/my/machines/{}/fwrules", args.machine))
        .await?;
    print_output(&rules, ctx.format);
    Ok(())
}
