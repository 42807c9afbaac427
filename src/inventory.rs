//! Where the treasury's funds currently sit, and what each market pays.
//!
//! Funds supplied to a lending market are held as its receipt token. On the
//! home chain the vault holds them; on every remote chain the agent does.

use std::collections::BTreeMap;

use alloy::primitives::{Address, U256};
use tracing::{debug, info};

use crate::chain::{ChainConfig, ChainError, ChainId, ChainPool};
use crate::optimizer::MarketSnapshot;

/// Per-chain USDC amount in base units.
pub type Allocation = BTreeMap<ChainId, u128>;

/// Total assets under management.
pub fn total(allocation: &Allocation) -> u128 {
    allocation.values().sum()
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("home chain {0} has no configuration")]
    MissingHomeConfig(ChainId),
    #[error("home chain {0} has no vault address")]
    MissingVault(ChainId),
    #[error("no configuration for chain {0}")]
    MissingChainConfig(ChainId),
    #[error("{what} on chain {chain} does not fit in u128: {value}")]
    Overflow {
        chain: ChainId,
        what: &'static str,
        value: U256,
    },
}

fn to_u128(chain: ChainId, what: &'static str, value: U256) -> Result<u128, InventoryError> {
    u128::try_from(value).map_err(|_| InventoryError::Overflow { chain, what, value })
}

/// Reads the receipt-token balance backing each configured chain.
pub async fn fetch_allocations(
    chains: &ChainPool,
    configs: &BTreeMap<ChainId, ChainConfig>,
    home: ChainId,
    agent: Address,
) -> Result<Allocation, InventoryError> {
    let vault = configs
        .get(&home)
        .ok_or(InventoryError::MissingHomeConfig(home))?
        .rebalancer
        .address()
        .ok_or(InventoryError::MissingVault(home))?;

    let mut allocation = Allocation::new();

    for (&chain_id, config) in configs {
        let chain = chains.get(chain_id)?;
        let receipt_token = chain
            .receipt_token(config.aave.lending_pool_address, config.aave.asset)
            .await
            .map_err(ChainError::from)?;

        let holder = if chain_id == home { vault } else { agent };
        let balance = chain
            .balance_of(receipt_token, holder)
            .await
            .map_err(ChainError::from)?;

        debug!(%chain_id, %holder, %receipt_token, %balance, "Fetched allocation");
        allocation.insert(chain_id, to_u128(chain_id, "receipt balance", balance)?);
    }

    info!(total = total(&allocation), chains = allocation.len(), "Fetched allocations");

    Ok(allocation)
}

/// Reads the lending reserve of every chain in `allocation`.
///
/// A chain listed in `rate_overrides` reports that supply rate instead of
/// the on-chain one.
pub async fn fetch_market_snapshots(
    chains: &ChainPool,
    configs: &BTreeMap<ChainId, ChainConfig>,
    allocation: &Allocation,
    rate_overrides: &BTreeMap<ChainId, f64>,
) -> Result<Vec<MarketSnapshot>, InventoryError> {
    let mut snapshots = Vec::with_capacity(allocation.len());

    for (&chain_id, &current_allocation) in allocation {
        let config = configs
            .get(&chain_id)
            .ok_or(InventoryError::MissingChainConfig(chain_id))?;

        let reserve = chains
            .get(chain_id)?
            .lending_reserve(config.aave.lending_pool_address, config.aave.asset)
            .await
            .map_err(ChainError::from)?;

        let current_interest_rate = match rate_overrides.get(&chain_id) {
            Some(&rate) => {
                debug!(%chain_id, rate, "Using configured interest rate override");
                rate
            }
            None => reserve.supply_rate_percent(),
        };

        snapshots.push(MarketSnapshot {
            chain_id,
            current_allocation,
            current_interest_rate,
            supply_elasticity: reserve.supply_elasticity(),
            total_supply: to_u128(chain_id, "total supply", reserve.total_supply)?,
            total_borrow: to_u128(chain_id, "total borrow", reserve.total_borrow)?,
        });
    }

    Ok(snapshots)
}
