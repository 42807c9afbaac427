//! Cross-chain USDC treasury rebalancer.
//!
//! A pass reads where the treasury's USDC sits across lending markets on
//! several EVM chains, optimizes the split for blended yield, derives the
//! transfers that reach it, and executes each transfer as a saga of
//! withdraw, bridge and re-deposit legs.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::primitives::Address;
use tracing::info;
use treasury_bridge::{AttestationSource, FeeQuoter};

use crate::chain::{ChainConfig, ChainId, ChainPool};
use crate::config::Ctx;
use crate::inventory::{Allocation, InventoryError, fetch_allocations, fetch_market_snapshots};
use crate::ledger::{LedgerClient, LedgerError, LedgerReader, NearRpcLedger, RebalancerContract};
use crate::orchestrator::{RebalanceOrchestrator, RebalancePlan, RebalanceReport};
use crate::saga::{SagaExecutor, StepLibrary};

pub mod chain;
pub mod cli;
pub mod config;
pub mod flow;
pub mod inventory;
pub mod ledger;
pub mod optimizer;
pub mod orchestrator;
pub mod planner;
pub mod saga;

pub use config::setup_tracing;

#[cfg(test)]
mod mock;

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// State read at the start of a pass and the plan derived from it.
#[derive(Debug, Clone)]
pub struct Survey {
    pub home: ChainId,
    pub configs: BTreeMap<ChainId, ChainConfig>,
    pub current: Allocation,
    pub plan: RebalancePlan,
}

/// Reads configuration, allocations and markets, and plans the transfers.
/// Sends nothing.
pub async fn survey<L: LedgerReader>(
    contract: &RebalancerContract<L>,
    chains: &ChainPool,
    agent: Address,
    rate_overrides: &BTreeMap<ChainId, f64>,
) -> Result<Survey, PassError> {
    let home = contract.source_chain().await?;
    let configs = contract.all_configs().await?;
    info!(%home, chains = configs.len(), "Loaded ledger configuration");

    let current = fetch_allocations(chains, &configs, home, agent).await?;
    let snapshots = fetch_market_snapshots(chains, &configs, &current, rate_overrides).await?;
    let plan = orchestrator::plan(&current, &snapshots);

    Ok(Survey {
        home,
        configs,
        current,
        plan,
    })
}

/// Read-only pass against the configured ledger and chain endpoints.
pub async fn plan_rebalance(ctx: &Ctx) -> Result<Survey, PassError> {
    let contract = RebalancerContract::new(NearRpcLedger::new(
        ctx.ledger.rpc_url.clone(),
        ctx.ledger.contract_id.clone(),
    ));

    survey(
        &contract,
        &ctx.chain_pool(),
        ctx.agent,
        &ctx.interest_rate_overrides,
    )
    .await
}

/// Full pass: survey, then execute every planned transfer.
///
/// `ledger` must be able to submit signed ledger transactions on behalf of
/// the agent.
pub async fn rebalance<L, B>(
    ctx: &Ctx,
    ledger: Arc<L>,
    chains: ChainPool,
    bridge: B,
) -> Result<(Survey, RebalanceReport), PassError>
where
    L: LedgerClient + ?Sized + 'static,
    B: FeeQuoter + AttestationSource,
{
    let reader = RebalancerContract::new(Arc::clone(&ledger));
    let library = StepLibrary::new(
        RebalancerContract::new(ledger),
        chains,
        bridge,
        ctx.bridge.settings,
    );

    let survey = survey(
        &reader,
        library.chains(),
        ctx.agent,
        &ctx.interest_rate_overrides,
    )
    .await?;

    let orchestrator = RebalanceOrchestrator::builder()
        .executor(SagaExecutor::new(
            library,
            ctx.saga.step_attempts,
            ctx.saga.step_retry_delay,
        ))
        .configs(survey.configs.clone())
        .home(survey.home)
        .agent(ctx.agent)
        .policy(ctx.on_failure)
        .build();

    let report = orchestrator.execute(&survey.plan.operations).await;
    info!(%report, "Rebalance complete");

    Ok((survey, report))
}
