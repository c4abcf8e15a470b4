//! Firewall rule commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::output::{print_output, print_single, truncate};

use super::machines::MachineResponse;
use super::{report, CommandContext, Submitted, WaitArgs};

/// Firewall rule commands.
#[derive(Debug, Args)]
pub struct RulesCommand {
    #[command(subcommand)]
    command: RulesSubcommand,
}

#[derive(Debug, Subcommand)]
enum RulesSubcommand {
    /// List firewall rules.
    List,

    /// Get rule details.
    Get(RuleArgs),

    /// Create a rule. It starts disabled.
    Create(CreateRuleArgs),

    /// Replace a rule's text.
    Update(UpdateRuleArgs),

    /// Enable a rule.
    Enable(RuleJobArgs),

    /// Disable a rule.
    Disable(RuleJobArgs),

    /// Delete a rule.
    Delete(RuleJobArgs),

    /// List the machines a rule affects.
    Machines(RuleArgs),
}

#[derive(Debug, Args)]
struct RuleArgs {
    /// Rule ID.
    rule: String,
}

#[derive(Debug, Args)]
struct RuleJobArgs {
    /// Rule ID.
    rule: String,

    #[command(flatten)]
    wait: WaitArgs,
}

#[derive(Debug, Args)]
struct CreateRuleArgs {
    /// Rule text, e.g. FROM any TO all vms ALLOW tcp port 22.
    #[arg(required = true, num_args = 1..)]
    text: Vec<String>,

    #[command(flatten)]
    wait: WaitArgs,
}

#[derive(Debug, Args)]
struct UpdateRuleArgs {
    /// Rule ID.
    rule: String,

    /// New rule text.
    #[arg(required = true, num_args = 1..)]
    text: Vec<String>,

    #[command(flatten)]
    wait: WaitArgs,
}

impl RulesCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            RulesSubcommand::List => list_rules(ctx).await,
            RulesSubcommand::Get(args) => get_rule(ctx, args).await,
            RulesSubcommand::Create(args) => create_rule(ctx, args).await,
            RulesSubcommand::Update(args) => update_rule(ctx, args).await,
            RulesSubcommand::Enable(args) => toggle_rule(ctx, args, true).await,
            RulesSubcommand::Disable(args) => toggle_rule(ctx, args, false).await,
            RulesSubcommand::Delete(args) => delete_rule(ctx, args).await,
            RulesSubcommand::Machines(args) => rule_machines(ctx, args).await,
        }
    }
}

/// Rule response from API.
#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
pub(super) struct RuleResponse {
    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "Rule", display = "display_rule")]
    rule: String,

    #[tabled(rename = "Enabled")]
    enabled: bool,

    #[tabled(skip)]
    created_at: String,

    #[tabled(rename = "Updated")]
    updated_at: String,
}

fn display_rule(rule: &str) -> String {
    truncate(rule, 60)
}

#[derive(Debug, Serialize)]
struct RuleRequest {
    rule: String,
}

async fn list_rules(ctx: CommandContext) -> Result<()> {
    let rules: Vec<RuleResponse> = ctx.client.get("/my/fwrules").await?;
    print_output(&rules, ctx.format);
    Ok(())
}

async fn get_rule(ctx: CommandContext, args: RuleArgs) -> Result<()> {
    let rule: RuleResponse = ctx.client.get(&format!("/my/fwrules/{}", args.rule)).await?;
    print_single(&rule, ctx.format);
    Ok(())
}

async fn create_rule(ctx: CommandContext, args: CreateRuleArgs) -> Result<()> {
    let request = RuleRequest {
        rule: args.text.join(" "),
    };
    let accepted = ctx.client.post::<RuleResponse, _>("/my/fwrules", &request).await?;

    report(
        &ctx,
        &args.wait,
        Submitted {
            kind: "rules.create",
            message: format!("Rule {} accepted", accepted.body.id),
            job_id: accepted.job_id,
            resource: serde_json::to_value(&accepted.body).ok(),
        },
    )
    .await
}

async fn update_rule(ctx: CommandContext, args: UpdateRuleArgs) -> Result<()> {
    let request = RuleRequest {
        rule: args.text.join(" "),
    };
    let accepted = ctx
        .client
        .post::<RuleResponse, _>(&format!("/my/fwrules/{}", args.rule), &request)
        .await?;

    report(
        &ctx,
        &args.wait,
        Submitted {
            kind: "rules.update",
            message: format!("Update of rule {} accepted", args.rule),
            job_id: accepted.job_id,
            resource: serde_json::to_value(&accepted.body).ok(),
        },
    )
    .await
}

async fn toggle_rule(ctx: CommandContext, args: RuleJobArgs, enable: bool) -> Result<()> {
    let (verb, kind) = if enable {
        ("enable", "rules.enable")
    } else {
        ("disable", "rules.disable")
    };
    let accepted = ctx
        .client
        .post::<RuleResponse, _>(
            &format!("/my/fwrules/{}/{verb}", args.rule),
            &serde_json::json!({}),
        )
        .await?;

    report(
        &ctx,
        &args.wait,
        Submitted {
            kind,
            message: format!("Request to {verb} rule {} accepted", args.rule),
            job_id: accepted.job_id,
            resource: serde_json::to_value(&accepted.body).ok(),
        },
    )
    .await
}

async fn delete_rule(ctx: CommandContext, args: RuleJobArgs) -> Result<()> {
    let job_id = ctx
        .client
        .delete(&format!("/my/fwrules/{}", args.rule))
        .await?;

    report(
        &ctx,
        &args.wait,
        Submitted {
            kind: "rules.delete",
            message: format!("Deletion of rule {} accepted", args.rule),
            job_id,
            resource: None,
        },
    )
    .await
}

async fn rule_machines(ctx: CommandContext, args: RuleArgs) -> Result<()> {
    let machines: Vec<MachineResponse> = ctx
        .client
        .get(&format!("/my/fwrules/{}/machines", args.rule))
        .await?;
    print_output(&machines, ctx.format);
    Ok(())
}
