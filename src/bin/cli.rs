//! Command-line interface for inspecting the rebalancer.

use treasury_rebalancer::cli;
use treasury_rebalancer::setup_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (ctx, command) = cli::CliEnv::parse_and_convert()?;
    setup_tracing(&ctx.log_level);

    cli::run_command(ctx, command).await?;
    Ok(())
}
