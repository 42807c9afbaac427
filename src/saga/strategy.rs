//! Step sequences per flow.

use std::collections::HashMap;

use super::step::Step;
use crate::flow::Flow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub flow: Flow,
    pub name: &'static str,
    pub steps: Vec<Step>,
}

impl Strategy {
    pub fn position(&self, step_name: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.name() == step_name)
    }
}

const BRIDGE_LEGS: [Step; 7] = [
    Step::ComputeCctpFees,
    Step::ApproveBeforeCctpBurn,
    Step::CctpBurn,
    Step::CctpBurnAfterAssertion,
    Step::WaitAttestation,
    Step::CctpMint,
    Step::CctpMintAfterAssertion,
];

const SUPPLY_LEGS: [Step; 4] = [
    Step::ApproveAaveBeforeSupply,
    Step::GetATokenBalanceBeforeSupply,
    Step::SupplyAave,
    Step::SupplyAaveAfterAssertion,
];

const DEPOSIT_LEGS: [Step; 4] = [
    Step::GetUsdcBalanceBeforeDeposit,
    Step::ApproveVaultToSpendAgentUsdc,
    Step::DepositIntoRebalancer,
    Step::DepositIntoRebalancerAfterAssertion,
];

fn sequence(withdraw: [Step; 2], arrival: &[Step]) -> Vec<Step> {
    [Step::GetUsdcBalanceBeforeRebalance, Step::StartRebalance]
        .into_iter()
        .chain(withdraw)
        .chain(BRIDGE_LEGS)
        .chain(arrival.iter().copied())
        .chain([Step::CompleteRebalance])
        .collect()
}

/// Strategy per flow. Built once and shared by reference.
#[derive(Debug, Clone)]
pub struct StrategyTable {
    strategies: HashMap<Flow, Strategy>,
}

impl StrategyTable {
    pub fn new(strategies: impl IntoIterator<Item = Strategy>) -> Self {
        Self {
            strategies: strategies
                .into_iter()
                .map(|strategy| (strategy.flow, strategy))
                .collect(),
        }
    }

    /// Vault to lending market, lending market to vault, and lending market
    /// to lending market.
    pub fn standard() -> Self {
        let from_vault = [Step::WithdrawFromRebalancer, Step::WithdrawFromRebalancerAfterAssertion];
        let from_market = [Step::WithdrawFromAave, Step::WithdrawFromAaveAfterAssertion];

        Self::new([
            Strategy {
                flow: Flow::HomeToRemote,
                name: "Rebalancer→Aave",
                steps: sequence(from_vault, &SUPPLY_LEGS),
            },
            Strategy {
                flow: Flow::RemoteToHome,
                name: "Aave→Rebalancer",
                steps: sequence(from_market, &DEPOSIT_LEGS),
            },
            Strategy {
                flow: Flow::RemoteToRemote,
                name: "Aave→Aave",
                steps: sequence(from_market, &SUPPLY_LEGS),
            },
        ])
    }

    pub fn get(&self, flow: Flow) -> Option<&Strategy> {
        self.strategies.get(&flow)
    }
}
