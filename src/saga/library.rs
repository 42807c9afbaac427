//! What each step does against the ledger, the chains and the bridge.

use alloy::primitives::{TxHash, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal_macros::dec;
use tracing::{debug, info, instrument};
use treasury_bridge::{AttestationSource, BridgeRoute, FeeQuoter};

use super::context::{
    Burn, DepositBaseline, FeeQuote, Mint, Preflight, Registration, RunContext, SupplyBaseline,
};
use super::step::{Step, StepError, StepRunner};
use crate::chain::{ChainId, ChainPool};
use crate::ledger::{LedgerClient, RebalancerContract, RemoteCall};

const BASIS_POINTS: Decimal = dec!(10_000);
/// Headroom over the quoted minimum so the burn is not rejected when the
/// quote moves between quoting and burning.
const FEE_HEADROOM: Decimal = dec!(1.05);

/// Bridge parameters shared by every saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Upper bound on the fee of a single transfer, in USDC base units.
    pub max_bridge_fee: u128,
    pub min_finality_threshold: u32,
}

/// `floor(floor(bps * amount / 10_000) * 1.05)`, capped at `max_fee`.
pub fn compute_bridge_fee(
    amount: u128,
    fee_bps: Decimal,
    max_fee: u128,
) -> Result<u128, StepError> {
    let fee = Decimal::from_u128(amount)
        .and_then(|amount| amount.checked_mul(fee_bps))
        .and_then(|scaled| scaled.checked_div(BASIS_POINTS))
        .and_then(|base| base.floor().checked_mul(FEE_HEADROOM))
        .and_then(|padded| padded.floor().to_u128())
        .ok_or(StepError::Overflow { what: "bridge fee" })?;

    Ok(fee.min(max_fee))
}

fn expect_equal(check: &'static str, expected: U256, actual: U256) -> Result<(), StepError> {
    if actual == expected {
        debug!(check, %actual, "Balance check passed");
        Ok(())
    } else {
        Err(StepError::BalanceInvariant {
            check,
            expected,
            actual,
        })
    }
}

/// Runs steps against the rebalancer contract, the chains and the bridge.
pub struct StepLibrary<L, B> {
    contract: RebalancerContract<L>,
    chains: ChainPool,
    bridge: B,
    settings: BridgeSettings,
}

impl<L, B> StepLibrary<L, B>
where
    L: LedgerClient,
    B: FeeQuoter + AttestationSource,
{
    pub const fn new(
        contract: RebalancerContract<L>,
        chains: ChainPool,
        bridge: B,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            contract,
            chains,
            bridge,
            settings,
        }
    }

    pub const fn chains(&self) -> &ChainPool {
        &self.chains
    }

    /// Has the ledger sign `call` for `chain`, broadcasts it and waits for
    /// the receipt.
    async fn send(
        &self,
        chain: ChainId,
        call: RemoteCall,
        note: &str,
    ) -> Result<TxHash, StepError> {
        let signed = self.contract.sign(chain, &call).await?;
        let tx_hash = self.chains.get(chain)?.broadcast(&signed.0, note).await?;

        info!(%chain, %tx_hash, note, "Transaction confirmed");
        Ok(tx_hash)
    }

    async fn agent_usdc(&self, context: &RunContext, on_source: bool) -> Result<U256, StepError> {
        let endpoint = if on_source {
            &context.route.source
        } else {
            &context.route.destination
        };

        Ok(self
            .chains
            .get(endpoint.chain)?
            .balance_of(endpoint.usdc, context.route.agent)
            .await?)
    }

    async fn withdrawn_to_agent(&self, context: &RunContext) -> Result<(), StepError> {
        let before = context.preflight()?.usdc_before;
        let expected = before
            .checked_add(context.amount())
            .ok_or(StepError::Overflow {
                what: "post-withdraw balance",
            })?;

        expect_equal(
            "source USDC after withdraw",
            expected,
            self.agent_usdc(context, true).await?,
        )
    }

    async fn run_step(&self, step: Step, context: &mut RunContext) -> Result<(), StepError> {
        let amount = context.amount();
        let source = context.route.source.clone();
        let destination = context.route.destination.clone();
        let agent = context.route.agent;

        match step {
            Step::GetUsdcBalanceBeforeRebalance => {
                let usdc_before = self.agent_usdc(context, true).await?;
                info!(%usdc_before, chain = %source.chain, "Recorded pre-rebalance balance");
                context.preflight = Some(Preflight { usdc_before });
            }

            Step::StartRebalance => {
                let nonce = self
                    .contract
                    .start_rebalance(
                        context.flow,
                        context.operation.from,
                        context.operation.to,
                        context.operation.amount,
                    )
                    .await?;
                context.registration = Some(Registration { nonce });
            }

            Step::WithdrawFromRebalancer => {
                let vault = context.route.vault(source.chain)?;
                self.send(
                    source.chain,
                    RemoteCall::VaultWithdraw { vault, amount },
                    "withdraw from vault",
                )
                .await?;
            }

            Step::WithdrawFromAave => {
                let call = RemoteCall::LendingWithdraw {
                    pool: source.lending_pool,
                    asset: source.asset,
                    amount,
                    to: agent,
                };
                self.send(source.chain, call, "withdraw from lending pool")
                    .await?;
            }

            Step::WithdrawFromRebalancerAfterAssertion | Step::WithdrawFromAaveAfterAssertion => {
                self.withdrawn_to_agent(context).await?;
            }

            Step::ComputeCctpFees => {
                let route = BridgeRoute {
                    source_domain: source.domain,
                    destination_domain: destination.domain,
                };
                let fee_bps = self
                    .bridge
                    .minimum_fee_bps(route, self.settings.min_finality_threshold)
                    .await?;
                let fee = compute_bridge_fee(
                    context.operation.amount,
                    fee_bps,
                    self.settings.max_bridge_fee,
                )?;

                info!(%fee_bps, fee, "Computed bridge fee");
                context.quote = Some(FeeQuote {
                    fee: U256::from(fee),
                });
            }

            Step::ApproveBeforeCctpBurn => {
                let total = burn_total(amount, context.quote()?.fee)?;
                let call = RemoteCall::Approve {
                    token: source.usdc,
                    spender: source.messenger,
                    amount: total,
                };
                self.send(source.chain, call, "approve bridge messenger")
                    .await?;
            }

            Step::CctpBurn => {
                let fee = context.quote()?.fee;
                let call = RemoteCall::CctpBurn {
                    messenger: source.messenger,
                    burn_token: source.usdc,
                    amount: burn_total(amount, fee)?,
                    destination_domain: destination.domain,
                    mint_recipient: agent,
                    max_fee: fee,
                    min_finality_threshold: self.settings.min_finality_threshold,
                };
                let tx = self.send(source.chain, call, "bridge burn").await?;
                context.burn = Some(Burn { tx });
            }

            Step::CctpBurnAfterAssertion => {
                let expected = context
                    .preflight()?
                    .usdc_before
                    .checked_sub(context.quote()?.fee)
                    .ok_or(StepError::Overflow {
                        what: "post-burn balance",
                    })?;

                expect_equal(
                    "source USDC after burn",
                    expected,
                    self.agent_usdc(context, true).await?,
                )?;
            }

            Step::WaitAttestation => {
                let burn_tx = context.burn()?.tx;
                let attestation = self
                    .bridge
                    .retrieve_attestation(source.domain, burn_tx)
                    .await?;

                info!(%burn_tx, "Attestation received");
                context.attestation = Some(attestation);
            }

            Step::CctpMint => {
                let attestation = context.attestation()?;
                let call = RemoteCall::CctpMint {
                    transmitter: destination.transmitter,
                    message: attestation.message.clone(),
                    attestation: attestation.attestation.clone(),
                };
                let tx = self.send(destination.chain, call, "bridge mint").await?;
                context.mint = Some(Mint { tx });
            }

            Step::CctpMintAfterAssertion => {
                let mint_tx = context.mint()?.tx;
                let actual = self.agent_usdc(context, false).await?;

                if actual < amount {
                    return Err(StepError::BalanceInvariant {
                        check: "destination USDC after mint, at least",
                        expected: amount,
                        actual,
                    });
                }
                debug!(%mint_tx, %actual, "Mint arrived");
            }

            Step::ApproveAaveBeforeSupply => {
                let call = RemoteCall::Approve {
                    token: destination.asset,
                    spender: destination.lending_pool,
                    amount,
                };
                self.send(destination.chain, call, "approve lending pool")
                    .await?;
            }

            Step::GetATokenBalanceBeforeSupply => {
                let chain = self.chains.get(destination.chain)?;
                let receipt_token = chain
                    .receipt_token(destination.lending_pool, destination.asset)
                    .await?;
                let before = chain
                    .balance_of(receipt_token, destination.on_behalf_of)
                    .await?;

                context.supply_baseline = Some(SupplyBaseline {
                    receipt_token,
                    before,
                });
            }

            Step::SupplyAave => {
                let call = RemoteCall::LendingSupply {
                    pool: destination.lending_pool,
                    asset: destination.asset,
                    amount,
                    on_behalf_of: destination.on_behalf_of,
                    referral_code: destination.referral_code,
                };
                self.send(destination.chain, call, "supply to lending pool")
                    .await?;
            }

            Step::SupplyAaveAfterAssertion => {
                let baseline = *context.supply_baseline()?;
                let expected = baseline
                    .before
                    .checked_add(amount)
                    .ok_or(StepError::Overflow {
                        what: "post-supply balance",
                    })?;
                let actual = self
                    .chains
                    .get(destination.chain)?
                    .balance_of(baseline.receipt_token, destination.on_behalf_of)
                    .await?;

                expect_equal("receipt token after supply", expected, actual)?;
            }

            Step::GetUsdcBalanceBeforeDeposit => {
                let before = self.agent_usdc(context, false).await?;
                context.deposit_baseline = Some(DepositBaseline { before });
            }

            Step::ApproveVaultToSpendAgentUsdc => {
                let call = RemoteCall::Approve {
                    token: destination.usdc,
                    spender: context.route.vault(destination.chain)?,
                    amount,
                };
                self.send(destination.chain, call, "approve vault").await?;
            }

            Step::DepositIntoRebalancer => {
                let vault = context.route.vault(destination.chain)?;
                self.send(
                    destination.chain,
                    RemoteCall::VaultDeposit { vault, amount },
                    "deposit into vault",
                )
                .await?;
            }

            Step::DepositIntoRebalancerAfterAssertion => {
                let expected = context
                    .deposit_baseline()?
                    .before
                    .checked_sub(amount)
                    .ok_or(StepError::Overflow {
                        what: "post-deposit balance",
                    })?;

                expect_equal(
                    "home USDC after deposit",
                    expected,
                    self.agent_usdc(context, false).await?,
                )?;
            }

            Step::CompleteRebalance => {
                let nonce = context.registration()?.nonce;
                self.contract.complete_rebalance(nonce).await?;
            }
        }

        Ok(())
    }
}

fn burn_total(amount: U256, fee: U256) -> Result<U256, StepError> {
    amount
        .checked_add(fee)
        .ok_or(StepError::Overflow { what: "burn amount" })
}

#[async_trait]
impl<L, B> StepRunner for StepLibrary<L, B>
where
    L: LedgerClient,
    B: FeeQuoter + AttestationSource,
{
    #[instrument(skip_all, fields(%step), level = "debug")]
    async fn run(&self, step: Step, context: &mut RunContext) -> Result<(), StepError> {
        self.run_step(step, context).await
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::mock::{self, AGENT, MockBridge, MockLedger, RECEIPT, USDC, VAULT, World};
    use crate::saga::context::tests::{ARBITRUM, HOME, context};

    const SETTINGS: BridgeSettings = BridgeSettings {
        max_bridge_fee: 990_000,
        min_finality_threshold: 1000,
    };

    fn library(world: &World) -> StepLibrary<MockLedger, MockBridge> {
        StepLibrary::new(
            RebalancerContract::new(MockLedger::new()),
            ChainPool::new(world.clone()),
            MockBridge::new(dec!(1)),
            SETTINGS,
        )
    }

    #[test]
    fn fee_pads_the_quoted_minimum() {
        assert_eq!(compute_bridge_fee(1_000_000, dec!(100), 990_000).unwrap(), 10_500);
    }

    #[test]
    fn fee_handles_fractional_basis_points() {
        // 1.3 bps of 1_000_000 is 130, padded to 136.5, floored to 136.
        assert_eq!(compute_bridge_fee(1_000_000, dec!(1.3), 990_000).unwrap(), 136);
    }

    #[test]
    fn fee_is_capped() {
        assert_eq!(compute_bridge_fee(1_000_000_000_000, dec!(100), 990_000).unwrap(), 990_000);
    }

    #[test]
    fn zero_fee_quote_costs_nothing() {
        assert_eq!(compute_bridge_fee(5_000_000, Decimal::ZERO, 990_000).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn fee_never_exceeds_cap_or_padded_quote(
            amount in 0u128..1_000_000_000_000_000,
            centi_bps in 0u32..100_000,
            cap in 0u128..10_000_000,
        ) {
            let bps = Decimal::new(i64::from(centi_bps), 2);
            let fee = compute_bridge_fee(amount, bps, cap).unwrap();

            let padded = Decimal::from_u128(amount).unwrap() * bps / dec!(10_000) * dec!(1.05);
            prop_assert!(fee <= cap);
            prop_assert!(Decimal::from_u128(fee).unwrap() <= padded);
        }
    }

    #[tokio::test]
    async fn preflight_records_agent_usdc_on_source() {
        let world = World::new(AGENT);
        world.set_balance(HOME, USDC, AGENT, 42);
        let library = library(&world);
        let mut context = context(HOME, ARBITRUM, 100);

        library
            .run(Step::GetUsdcBalanceBeforeRebalance, &mut context)
            .await
            .unwrap();

        assert_eq!(context.preflight().unwrap().usdc_before, U256::from(42));
    }

    #[tokio::test]
    async fn vault_withdraw_moves_funds_to_the_agent() {
        let world = World::new(AGENT);
        world.set_balance(HOME, RECEIPT, VAULT, 1_000);
        let library = library(&world);
        let mut context = context(HOME, ARBITRUM, 400);
        context.preflight = Some(Preflight {
            usdc_before: U256::ZERO,
        });

        library
            .run(Step::WithdrawFromRebalancer, &mut context)
            .await
            .unwrap();
        library
            .run(Step::WithdrawFromRebalancerAfterAssertion, &mut context)
            .await
            .unwrap();

        assert_eq!(world.balance(HOME, USDC, AGENT), 400);
        assert_eq!(world.broadcasts_on(HOME), ["vault_withdraw"]);
    }

    #[tokio::test]
    async fn withdraw_assertion_fails_when_funds_did_not_arrive() {
        let world = World::new(AGENT);
        world.set_balance(HOME, USDC, AGENT, 10);
        let library = library(&world);
        let mut context = context(HOME, ARBITRUM, 400);
        context.preflight = Some(Preflight {
            usdc_before: U256::from(10),
        });

        let error = library
            .run(Step::WithdrawFromRebalancerAfterAssertion, &mut context)
            .await
            .unwrap_err();

        assert!(
            matches!(error, StepError::BalanceInvariant { expected, actual, .. }
                if expected == U256::from(410) && actual == U256::from(10)),
            "Expected balance invariant, got {error:?}"
        );
    }

    #[tokio::test]
    async fn fee_quote_uses_configured_finality() {
        let world = World::new(AGENT);
        let library = StepLibrary::new(
            RebalancerContract::new(MockLedger::new()),
            ChainPool::new(world),
            MockBridge::new(dec!(100)),
            SETTINGS,
        );
        let mut context = context(HOME, ARBITRUM, 1_000_000);

        library
            .run(Step::ComputeCctpFees, &mut context)
            .await
            .unwrap();

        assert_eq!(context.quote().unwrap().fee, U256::from(10_500));
    }

    #[tokio::test]
    async fn burn_needs_a_quote() {
        let world = World::new(AGENT);
        let library = library(&world);
        let mut context = context(HOME, ARBITRUM, 1_000);

        let error = library.run(Step::CctpBurn, &mut context).await.unwrap_err();

        assert!(matches!(error, StepError::MissingContext { .. }));
        assert!(world.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn unknown_receipt_token_is_a_chain_error() {
        let world = World::new(AGENT);
        let library = library(&world);
        let mut context = context(HOME, ARBITRUM, 1_000);

        let error = library
            .run(Step::GetATokenBalanceBeforeSupply, &mut context)
            .await
            .unwrap_err();

        assert!(matches!(error, StepError::Chain(_)));
    }

    #[tokio::test]
    async fn supply_credits_receipt_tokens() {
        let world = World::new(AGENT);
        world.add_market(ARBITRUM, mock::reserve(5.0, 1_000_000, 500_000));
        world.set_balance(ARBITRUM, USDC, AGENT, 700);
        world.set_balance(ARBITRUM, RECEIPT, AGENT, 50);
        let library = library(&world);
        let mut context = context(HOME, ARBITRUM, 700);

        for step in [
            Step::ApproveAaveBeforeSupply,
            Step::GetATokenBalanceBeforeSupply,
            Step::SupplyAave,
            Step::SupplyAaveAfterAssertion,
        ] {
            library.run(step, &mut context).await.unwrap();
        }

        assert_eq!(
            context.supply_baseline().unwrap().before,
            U256::from(50)
        );
        assert_eq!(world.balance(ARBITRUM, RECEIPT, AGENT), 750);
        assert_eq!(world.balance(ARBITRUM, USDC, AGENT), 0);
    }
}
