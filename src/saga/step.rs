//! The closed set of saga steps.

use std::fmt;

use alloy::primitives::U256;
use async_trait::async_trait;
use treasury_bridge::BridgeError;
use treasury_evm::EvmError;

use super::context::{ContextField, RouteError, RunContext};
use crate::chain::ChainError;
use crate::ledger::LedgerError;

/// One unit of work in a saga. The variant name is the step's stable name,
/// used for logging and for restarting a saga part-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    GetUsdcBalanceBeforeRebalance,
    StartRebalance,
    WithdrawFromRebalancer,
    WithdrawFromRebalancerAfterAssertion,
    WithdrawFromAave,
    WithdrawFromAaveAfterAssertion,
    ComputeCctpFees,
    ApproveBeforeCctpBurn,
    CctpBurn,
    CctpBurnAfterAssertion,
    WaitAttestation,
    CctpMint,
    CctpMintAfterAssertion,
    ApproveAaveBeforeSupply,
    GetATokenBalanceBeforeSupply,
    SupplyAave,
    SupplyAaveAfterAssertion,
    GetUsdcBalanceBeforeDeposit,
    ApproveVaultToSpendAgentUsdc,
    DepositIntoRebalancer,
    DepositIntoRebalancerAfterAssertion,
    CompleteRebalance,
}

impl Step {
    pub const ALL: [Self; 22] = [
        Self::GetUsdcBalanceBeforeRebalance,
        Self::StartRebalance,
        Self::WithdrawFromRebalancer,
        Self::WithdrawFromRebalancerAfterAssertion,
        Self::WithdrawFromAave,
        Self::WithdrawFromAaveAfterAssertion,
        Self::ComputeCctpFees,
        Self::ApproveBeforeCctpBurn,
        Self::CctpBurn,
        Self::CctpBurnAfterAssertion,
        Self::WaitAttestation,
        Self::CctpMint,
        Self::CctpMintAfterAssertion,
        Self::ApproveAaveBeforeSupply,
        Self::GetATokenBalanceBeforeSupply,
        Self::SupplyAave,
        Self::SupplyAaveAfterAssertion,
        Self::GetUsdcBalanceBeforeDeposit,
        Self::ApproveVaultToSpendAgentUsdc,
        Self::DepositIntoRebalancer,
        Self::DepositIntoRebalancerAfterAssertion,
        Self::CompleteRebalance,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::GetUsdcBalanceBeforeRebalance => "GetUsdcBalanceBeforeRebalance",
            Self::StartRebalance => "StartRebalance",
            Self::WithdrawFromRebalancer => "WithdrawFromRebalancer",
            Self::WithdrawFromRebalancerAfterAssertion => "WithdrawFromRebalancerAfterAssertion",
            Self::WithdrawFromAave => "WithdrawFromAave",
            Self::WithdrawFromAaveAfterAssertion => "WithdrawFromAaveAfterAssertion",
            Self::ComputeCctpFees => "ComputeCctpFees",
            Self::ApproveBeforeCctpBurn => "ApproveBeforeCctpBurn",
            Self::CctpBurn => "CctpBurn",
            Self::CctpBurnAfterAssertion => "CctpBurnAfterAssertion",
            Self::WaitAttestation => "WaitAttestation",
            Self::CctpMint => "CctpMint",
            Self::CctpMintAfterAssertion => "CctpMintAfterAssertion",
            Self::ApproveAaveBeforeSupply => "ApproveAaveBeforeSupply",
            Self::GetATokenBalanceBeforeSupply => "GetATokenBalanceBeforeSupply",
            Self::SupplyAave => "SupplyAave",
            Self::SupplyAaveAfterAssertion => "SupplyAaveAfterAssertion",
            Self::GetUsdcBalanceBeforeDeposit => "GetUsdcBalanceBeforeDeposit",
            Self::ApproveVaultToSpendAgentUsdc => "ApproveVaultToSpendAgentUsdc",
            Self::DepositIntoRebalancer => "DepositIntoRebalancer",
            Self::DepositIntoRebalancerAfterAssertion => "DepositIntoRebalancerAfterAssertion",
            Self::CompleteRebalance => "CompleteRebalance",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.name() == name)
    }

    /// Records that must be present before this step runs.
    pub const fn requires(self) -> &'static [ContextField] {
        use ContextField::{
            Attestation, Burn, DepositBaseline, Mint, Preflight, Quote, Registration,
            SupplyBaseline,
        };

        match self {
            Self::WithdrawFromRebalancerAfterAssertion | Self::WithdrawFromAaveAfterAssertion => {
                &[Preflight]
            }
            Self::ApproveBeforeCctpBurn | Self::CctpBurn => &[Quote],
            Self::CctpBurnAfterAssertion => &[Preflight, Quote],
            Self::WaitAttestation => &[Burn],
            Self::CctpMint => &[Attestation],
            Self::CctpMintAfterAssertion => &[Mint],
            Self::SupplyAaveAfterAssertion => &[SupplyBaseline],
            Self::DepositIntoRebalancerAfterAssertion => &[DepositBaseline],
            Self::CompleteRebalance => &[Registration],
            Self::GetUsdcBalanceBeforeRebalance
            | Self::StartRebalance
            | Self::WithdrawFromRebalancer
            | Self::WithdrawFromAave
            | Self::ComputeCctpFees
            | Self::ApproveAaveBeforeSupply
            | Self::GetATokenBalanceBeforeSupply
            | Self::SupplyAave
            | Self::GetUsdcBalanceBeforeDeposit
            | Self::ApproveVaultToSpendAgentUsdc
            | Self::DepositIntoRebalancer => &[],
        }
    }

    /// Record this step fills in, if any.
    pub const fn produces(self) -> Option<ContextField> {
        match self {
            Self::GetUsdcBalanceBeforeRebalance => Some(ContextField::Preflight),
            Self::StartRebalance => Some(ContextField::Registration),
            Self::ComputeCctpFees => Some(ContextField::Quote),
            Self::CctpBurn => Some(ContextField::Burn),
            Self::WaitAttestation => Some(ContextField::Attestation),
            Self::CctpMint => Some(ContextField::Mint),
            Self::GetATokenBalanceBeforeSupply => Some(ContextField::SupplyBaseline),
            Self::GetUsdcBalanceBeforeDeposit => Some(ContextField::DepositBaseline),
            _ => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("balance check failed ({check}): expected {expected}, found {actual}")]
    BalanceInvariant {
        check: &'static str,
        expected: U256,
        actual: U256,
    },
    #[error("context record {field} was never populated")]
    MissingContext { field: ContextField },
    #[error("arithmetic overflow computing {what}")]
    Overflow { what: &'static str },
}

impl From<EvmError> for StepError {
    fn from(error: EvmError) -> Self {
        Self::Chain(ChainError::Evm(error))
    }
}

impl StepError {
    /// Only transport-level failures are worth repeating. A failed balance
    /// check means funds are not where the saga expects them.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ledger(error) => error.is_transient(),
            Self::Chain(error) => error.is_transient(),
            Self::Bridge(error) => error.is_transient(),
            Self::Route(_)
            | Self::BalanceInvariant { .. }
            | Self::MissingContext { .. }
            | Self::Overflow { .. } => false,
        }
    }
}

/// Executes a single step against a run context.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, step: Step, context: &mut RunContext) -> Result<(), StepError>;
}

#[async_trait]
impl<T: StepRunner + ?Sized> StepRunner for std::sync::Arc<T> {
    async fn run(&self, step: Step, context: &mut RunContext) -> Result<(), StepError> {
        (**self).run(step, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_lookup() {
        for step in Step::ALL {
            assert_eq!(Step::from_name(step.name()), Some(step));
        }
        assert_eq!(Step::from_name("CctpBurnn"), None);
    }

    #[test]
    fn every_field_has_exactly_one_producer() {
        for field in ContextField::ALL {
            let producers = Step::ALL
                .iter()
                .filter(|step| step.produces() == Some(field))
                .count();
            assert_eq!(producers, 1, "{field} has {producers} producers");
        }
    }

    #[test]
    fn balance_failures_are_not_retryable() {
        let invariant = StepError::BalanceInvariant {
            check: "post-withdraw",
            expected: U256::from(2),
            actual: U256::from(1),
        };
        let transient = StepError::Ledger(LedgerError::Rpc("timeout".to_owned()));
        let reverted = StepError::from(EvmError::Reverted {
            tx_hash: Default::default(),
        });

        assert!(!invariant.is_retryable());
        assert!(transient.is_retryable());
        assert!(!reverted.is_retryable());
        assert!(
            !StepError::MissingContext {
                field: ContextField::Burn
            }
            .is_retryable()
        );
    }
}
