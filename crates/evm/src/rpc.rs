//! [`Chain`] over an alloy provider.

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::Provider;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::bindings::{IERC20, IPool, IReserveInterestRateStrategy};
use crate::{Chain, EvmError, LendingReserve};

/// Chain handle backed by a JSON-RPC provider.
///
/// Holds no signer: everything it broadcasts was signed elsewhere.
pub struct AlloyChain<P> {
    provider: P,
    required_confirmations: u64,
}

impl<P> AlloyChain<P> {
    pub fn new(provider: P, required_confirmations: u64) -> Self {
        Self {
            provider,
            required_confirmations,
        }
    }
}

#[async_trait]
impl<P> Chain for AlloyChain<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, EvmError> {
        let balance = IERC20::new(token, &self.provider)
            .balanceOf(holder)
            .call()
            .await?;

        debug!(%token, %holder, %balance, "Read token balance");

        Ok(balance)
    }

    async fn receipt_token(
        &self,
        lending_pool: Address,
        asset: Address,
    ) -> Result<Address, EvmError> {
        let reserve = IPool::new(lending_pool, &self.provider)
            .getReserveData(asset)
            .call()
            .await?;

        Ok(reserve.aTokenAddress)
    }

    async fn lending_reserve(
        &self,
        lending_pool: Address,
        asset: Address,
    ) -> Result<LendingReserve, EvmError> {
        let reserve = IPool::new(lending_pool, &self.provider)
            .getReserveData(asset)
            .call()
            .await?;

        let total_supply = IERC20::new(reserve.aTokenAddress, &self.provider)
            .totalSupply()
            .call()
            .await?;
        let total_borrow = IERC20::new(reserve.variableDebtTokenAddress, &self.provider)
            .totalSupply()
            .call()
            .await?;

        let strategy =
            IReserveInterestRateStrategy::new(reserve.interestRateStrategyAddress, &self.provider);
        let variable_rate_slope1 = strategy.getVariableRateSlope1().call().await?;
        let optimal_usage_ratio = strategy.OPTIMAL_USAGE_RATIO().call().await?;

        Ok(LendingReserve {
            receipt_token: reserve.aTokenAddress,
            liquidity_rate: U256::from(reserve.currentLiquidityRate),
            total_supply,
            total_borrow,
            variable_rate_slope1,
            optimal_usage_ratio,
        })
    }

    async fn broadcast(&self, signed_tx: &Bytes, note: &str) -> Result<TxHash, EvmError> {
        let pending = self.provider.send_raw_transaction(signed_tx).await?;

        info!(tx_hash = %pending.tx_hash(), note, "Transaction submitted");

        let receipt = pending
            .with_required_confirmations(self.required_confirmations)
            .get_receipt()
            .await?;

        if !receipt.status() {
            return Err(EvmError::Reverted {
                tx_hash: receipt.transaction_hash,
            });
        }

        info!(tx_hash = %receipt.transaction_hash, note, "Transaction confirmed");

        Ok(receipt.transaction_hash)
    }
}
