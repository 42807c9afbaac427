//! EVM chain access for the rebalancer.
//!
//! The rebalancer never signs on a remote chain itself: transactions are
//! built and signed by the home ledger and arrive here as raw bytes. What
//! the agent needs from a chain is therefore narrow:
//!
//! - token balance reads (USDC and lending receipt tokens),
//! - lending reserve reads (receipt token, rates, supply and borrow),
//! - broadcasting a signed transaction and waiting for its receipt.
//!
//! [`Chain`] captures that surface. [`rpc::AlloyChain`] implements it over
//! any alloy [`Provider`](alloy::providers::Provider).

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;

pub mod bindings;
pub mod rpc;

/// Aave rates and ratios are fixed-point with 27 decimals.
const RAY_DECIMALS: i32 = 27;

/// Errors that can occur during EVM operations.
#[derive(Debug, thiserror::Error)]
pub enum EvmError {
    #[error("transaction error: {0}")]
    Transaction(#[from] alloy::providers::PendingTransactionError),
    #[error("transport error: {0}")]
    Transport(#[from] alloy::transports::RpcError<alloy::transports::TransportErrorKind>),
    #[error("contract error: {0}")]
    Contract(#[from] alloy::contract::Error),
    #[error("transaction reverted: {tx_hash}")]
    Reverted { tx_hash: TxHash },
}

impl EvmError {
    /// Whether the failed call may succeed when repeated.
    ///
    /// A mined revert is final. So is a failure while waiting for the
    /// receipt: the node already accepted the transaction, and sending a
    /// freshly signed one would repeat its effect.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Contract(_))
    }
}

/// Snapshot of one lending reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LendingReserve {
    /// Interest-bearing receipt token minted on supply.
    pub receipt_token: Address,
    /// Current supply (liquidity) rate, in ray.
    pub liquidity_rate: U256,
    /// Total supplied, in asset base units.
    pub total_supply: U256,
    /// Total variable debt, in asset base units.
    pub total_borrow: U256,
    /// Variable borrow rate slope below the optimal usage ratio, in ray.
    pub variable_rate_slope1: U256,
    /// Optimal usage ratio, in ray.
    pub optimal_usage_ratio: U256,
}

impl LendingReserve {
    /// Current supply rate in percent.
    pub fn supply_rate_percent(&self) -> f64 {
        ray_to_percent(self.liquidity_rate)
    }

    /// Rate change per utilization percentage point, from the first slope
    /// of the rate curve.
    pub fn supply_elasticity(&self) -> f64 {
        let optimal = ray_to_percent(self.optimal_usage_ratio);
        if optimal <= 0.0 {
            return 0.0;
        }

        ray_to_percent(self.variable_rate_slope1) / optimal
    }
}

fn ray_to_percent(value: U256) -> f64 {
    let Ok(value) = u128::try_from(value) else {
        return f64::MAX;
    };

    value as f64 / 10f64.powi(RAY_DECIMALS - 2)
}

/// Read and broadcast access to a single EVM chain.
#[async_trait]
pub trait Chain: Send + Sync + 'static {
    /// ERC-20 balance of `holder`.
    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, EvmError>;

    /// Receipt token the lending pool mints for `asset`.
    async fn receipt_token(&self, lending_pool: Address, asset: Address)
    -> Result<Address, EvmError>;

    async fn lending_reserve(
        &self,
        lending_pool: Address,
        asset: Address,
    ) -> Result<LendingReserve, EvmError>;

    /// Broadcasts a signed transaction and waits until it is mined.
    ///
    /// A mined but reverted transaction is [`EvmError::Reverted`].
    async fn broadcast(&self, signed_tx: &Bytes, note: &str) -> Result<TxHash, EvmError>;
}

#[async_trait]
impl<T: Chain + ?Sized> Chain for Arc<T> {
    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, EvmError> {
        (**self).balance_of(token, holder).await
    }

    async fn receipt_token(
        &self,
        lending_pool: Address,
        asset: Address,
    ) -> Result<Address, EvmError> {
        (**self).receipt_token(lending_pool, asset).await
    }

    async fn lending_reserve(
        &self,
        lending_pool: Address,
        asset: Address,
    ) -> Result<LendingReserve, EvmError> {
        (**self).lending_reserve(lending_pool, asset).await
    }

    async fn broadcast(&self, signed_tx: &Bytes, note: &str) -> Result<TxHash, EvmError> {
        (**self).broadcast(signed_tx, note).await
    }
}
