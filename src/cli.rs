//! Command-line interface for inspecting the rebalancer.

use std::io::Write;

use clap::{Parser, Subcommand};
use itertools::Itertools;

use crate::Survey;
use crate::config::{Ctx, Env};

#[derive(Debug, Parser)]
#[command(name = "rebalancer")]
#[command(about = "Cross-chain USDC treasury rebalancer")]
#[command(version)]
pub struct CliEnv {
    #[clap(flatten)]
    env: Env,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the current allocation, the optimal one, and the transfers
    /// between them. Sends nothing.
    Plan,
}

impl CliEnv {
    /// Parse CLI arguments and load config and secrets from the given paths.
    pub fn parse_and_convert() -> anyhow::Result<(Ctx, Commands)> {
        let cli = Self::parse();
        let ctx = Ctx::load_files(&cli.env.config, &cli.env.secrets)?;
        Ok((ctx, cli.command))
    }
}

pub async fn run_command(ctx: Ctx, command: Commands) -> anyhow::Result<()> {
    run_command_with_writer(ctx, command, &mut std::io::stdout()).await
}

async fn run_command_with_writer<W: Write>(
    ctx: Ctx,
    command: Commands,
    stdout: &mut W,
) -> anyhow::Result<()> {
    match command {
        Commands::Plan => {
            let survey = crate::plan_rebalance(&ctx).await?;
            write_plan(stdout, &survey)?;
        }
    }

    Ok(())
}

/// USDC base units (6 decimals) as a decimal string.
fn usdc(amount: u128) -> String {
    format!("{}.{:06}", amount / 1_000_000, amount % 1_000_000)
}

fn write_plan<W: Write>(stdout: &mut W, survey: &Survey) -> std::io::Result<()> {
    let optimization = &survey.plan.optimization;

    writeln!(stdout, "Home chain: {}", survey.home)?;
    writeln!(stdout, "Chains: {}", survey.current.keys().join(", "))?;
    writeln!(stdout)?;
    writeln!(stdout, "{:>10}  {:>20}  {:>20}  {:>10}", "chain", "current", "target", "rate Δ")?;

    for (chain, current) in &survey.current {
        let target = optimization
            .target_allocations
            .get(chain)
            .copied()
            .unwrap_or_default();
        let delta = optimization
            .projected_rate_deltas
            .get(chain)
            .copied()
            .unwrap_or_default();

        writeln!(
            stdout,
            "{chain:>10}  {:>20}  {:>20}  {delta:>+10.4}",
            usdc(*current),
            usdc(target)
        )?;
    }

    writeln!(stdout)?;
    writeln!(
        stdout,
        "Blended rate: {:.4}% -> {:.4}%{}",
        optimization.current_avg_rate,
        optimization.projected_avg_rate,
        if optimization.converged {
            ""
        } else {
            " (optimizer did not converge, keeping current allocation)"
        }
    )?;

    if survey.plan.operations.is_empty() {
        writeln!(stdout, "No transfers needed")?;
        return Ok(());
    }

    writeln!(stdout, "Transfers:")?;
    for operation in &survey.plan.operations {
        writeln!(
            stdout,
            "  {} -> {}: {} USDC",
            operation.from,
            operation.to,
            usdc(operation.amount)
        )?;
    }

    Ok(())
}
