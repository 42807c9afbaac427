//! Per-saga scratch space.
//!
//! A [`RunContext`] is created once per transfer, threaded through every
//! step by mutable reference, and returned (or attached to the failure) at
//! the end. Each producing step fills exactly one record; consuming steps
//! read it through an accessor that fails with
//! [`StepError::MissingContext`] when the record is absent.

use std::collections::BTreeMap;
use std::fmt;

use alloy::primitives::{Address, TxHash, U256};
use treasury_bridge::{Attestation, cctp_domain};

use super::step::StepError;
use crate::chain::{ChainConfig, ChainId};
use crate::flow::Flow;
use crate::planner::TransferOperation;

/// The context records a step can produce or require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextField {
    Preflight,
    Registration,
    Quote,
    Burn,
    Attestation,
    Mint,
    SupplyBaseline,
    DepositBaseline,
}

impl ContextField {
    pub const ALL: [Self; 8] = [
        Self::Preflight,
        Self::Registration,
        Self::Quote,
        Self::Burn,
        Self::Attestation,
        Self::Mint,
        Self::SupplyBaseline,
        Self::DepositBaseline,
    ];
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no configuration for chain {0}")]
    MissingChainConfig(ChainId),
    #[error("chain {0} has no bridge domain")]
    UnsupportedDomain(ChainId),
    #[error("chain {0} has no vault address configured")]
    MissingVaultAddress(ChainId),
}

/// Addresses a saga needs on one end of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEndpoint {
    pub chain: ChainId,
    pub domain: u32,
    pub usdc: Address,
    pub messenger: Address,
    pub transmitter: Address,
    pub lending_pool: Address,
    pub asset: Address,
    pub on_behalf_of: Address,
    pub referral_code: u16,
}

impl ChainEndpoint {
    fn resolve(
        chain: ChainId,
        configs: &BTreeMap<ChainId, ChainConfig>,
    ) -> Result<(Self, &ChainConfig), RouteError> {
        let config = configs
            .get(&chain)
            .ok_or(RouteError::MissingChainConfig(chain))?;
        let domain = cctp_domain(chain.0).ok_or(RouteError::UnsupportedDomain(chain))?;

        let endpoint = Self {
            chain,
            domain,
            usdc: config.cctp.usdc_address,
            messenger: config.cctp.messenger_address,
            transmitter: config.cctp.transmitter_address,
            lending_pool: config.aave.lending_pool_address,
            asset: config.aave.asset,
            on_behalf_of: config.aave.on_behalf_of,
            referral_code: config.aave.referral_code,
        };

        Ok((endpoint, config))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub source: ChainEndpoint,
    pub destination: ChainEndpoint,
    pub agent: Address,
    /// Home vault, present when one end of the transfer is the home chain.
    pub vault: Option<Address>,
}

impl Route {
    /// The home vault, which a step running on `chain` expects to find there.
    pub fn vault(&self, chain: ChainId) -> Result<Address, StepError> {
        self.vault
            .ok_or(StepError::Route(RouteError::MissingVaultAddress(chain)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preflight {
    /// Agent USDC on the source chain before anything moved.
    pub usdc_before: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub fee: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Burn {
    pub tx: TxHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mint {
    pub tx: TxHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupplyBaseline {
    pub receipt_token: Address,
    pub before: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositBaseline {
    /// Agent USDC on the home chain before depositing.
    pub before: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub operation: TransferOperation,
    pub flow: Flow,
    pub route: Route,
    pub preflight: Option<Preflight>,
    pub registration: Option<Registration>,
    pub quote: Option<FeeQuote>,
    pub burn: Option<Burn>,
    pub attestation: Option<Attestation>,
    pub mint: Option<Mint>,
    pub supply_baseline: Option<SupplyBaseline>,
    pub deposit_baseline: Option<DepositBaseline>,
}

fn require<T>(record: Option<&T>, field: ContextField) -> Result<&T, StepError> {
    record.ok_or(StepError::MissingContext { field })
}

impl RunContext {
    pub fn new(operation: TransferOperation, flow: Flow, route: Route) -> Self {
        Self {
            operation,
            flow,
            route,
            preflight: None,
            registration: None,
            quote: None,
            burn: None,
            attestation: None,
            mint: None,
            supply_baseline: None,
            deposit_baseline: None,
        }
    }

    /// Resolves both ends of `operation` from the ledger-held configuration.
    ///
    /// Fails before any transaction is sent if a chain is unconfigured, has
    /// no bridge domain, or is the home end of the transfer without a vault.
    pub fn resolve(
        operation: TransferOperation,
        flow: Flow,
        configs: &BTreeMap<ChainId, ChainConfig>,
        agent: Address,
    ) -> Result<Self, RouteError> {
        let (source, source_config) = ChainEndpoint::resolve(operation.from, configs)?;
        let (destination, destination_config) = ChainEndpoint::resolve(operation.to, configs)?;

        let vault = match flow {
            Flow::HomeToRemote => Some(
                source_config
                    .rebalancer
                    .address()
                    .ok_or(RouteError::MissingVaultAddress(operation.from))?,
            ),
            Flow::RemoteToHome => Some(
                destination_config
                    .rebalancer
                    .address()
                    .ok_or(RouteError::MissingVaultAddress(operation.to))?,
            ),
            Flow::RemoteToRemote => None,
        };

        let route = Route {
            source,
            destination,
            agent,
            vault,
        };

        Ok(Self::new(operation, flow, route))
    }

    pub fn amount(&self) -> U256 {
        U256::from(self.operation.amount)
    }

    /// Whether `field` has been recorded.
    pub const fn has(&self, field: ContextField) -> bool {
        match field {
            ContextField::Preflight => self.preflight.is_some(),
            ContextField::Registration => self.registration.is_some(),
            ContextField::Quote => self.quote.is_some(),
            ContextField::Burn => self.burn.is_some(),
            ContextField::Attestation => self.attestation.is_some(),
            ContextField::Mint => self.mint.is_some(),
            ContextField::SupplyBaseline => self.supply_baseline.is_some(),
            ContextField::DepositBaseline => self.deposit_baseline.is_some(),
        }
    }

    pub fn preflight(&self) -> Result<&Preflight, StepError> {
        require(self.preflight.as_ref(), ContextField::Preflight)
    }

    pub fn registration(&self) -> Result<&Registration, StepError> {
        require(self.registration.as_ref(), ContextField::Registration)
    }

    pub fn quote(&self) -> Result<&FeeQuote, StepError> {
        require(self.quote.as_ref(), ContextField::Quote)
    }

    pub fn burn(&self) -> Result<&Burn, StepError> {
        require(self.burn.as_ref(), ContextField::Burn)
    }

    pub fn attestation(&self) -> Result<&Attestation, StepError> {
        require(self.attestation.as_ref(), ContextField::Attestation)
    }

    pub fn mint(&self) -> Result<&Mint, StepError> {
        require(self.mint.as_ref(), ContextField::Mint)
    }

    pub fn supply_baseline(&self) -> Result<&SupplyBaseline, StepError> {
        require(self.supply_baseline.as_ref(), ContextField::SupplyBaseline)
    }

    pub fn deposit_baseline(&self) -> Result<&DepositBaseline, StepError> {
        require(self.deposit_baseline.as_ref(), ContextField::DepositBaseline)
    }
}
