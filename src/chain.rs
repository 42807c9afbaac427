//! Chain identifiers, ledger-held per-chain configuration, and the per-run
//! cache of chain handles.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;
use treasury_evm::Chain;
use treasury_evm::rpc::AlloyChain;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-chain configuration as stored on the home ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub aave: LendingConfig,
    pub cctp: CctpConfig,
    pub rebalancer: VaultConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LendingConfig {
    pub asset: Address,
    pub on_behalf_of: Address,
    pub referral_code: u16,
    pub lending_pool_address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CctpConfig {
    pub messenger_address: Address,
    pub transmitter_address: Address,
    pub usdc_address: Address,
}

/// Only the home chain has a vault; remote entries carry an empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    pub vault_address: String,
}

impl VaultConfig {
    /// The vault address, if one is configured.
    pub fn address(&self) -> Option<Address> {
        self.vault_address
            .parse::<Address>()
            .ok()
            .filter(|address| !address.is_zero())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("no RPC endpoint configured for chain {0}")]
    NoEndpoint(ChainId),
    #[error(transparent)]
    Evm(#[from] treasury_evm::EvmError),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NoEndpoint(_) => false,
            Self::Evm(error) => error.is_transient(),
        }
    }
}

/// Opens a handle to a chain.
pub trait ChainConnector: Send + Sync {
    fn connect(&self, chain: ChainId) -> Result<Arc<dyn Chain>, ChainError>;
}

/// Connects over HTTP JSON-RPC using the configured endpoint per chain.
pub struct RpcConnector {
    endpoints: HashMap<ChainId, Url>,
    required_confirmations: u64,
}

impl RpcConnector {
    pub fn new(endpoints: HashMap<ChainId, Url>, required_confirmations: u64) -> Self {
        Self {
            endpoints,
            required_confirmations,
        }
    }
}

impl ChainConnector for RpcConnector {
    fn connect(&self, chain: ChainId) -> Result<Arc<dyn Chain>, ChainError> {
        let url = self
            .endpoints
            .get(&chain)
            .ok_or(ChainError::NoEndpoint(chain))?;

        let provider = ProviderBuilder::new().connect_http(url.clone());

        Ok(Arc::new(AlloyChain::new(
            provider,
            self.required_confirmations,
        )))
    }
}

/// Hands out one cached chain handle per chain for the lifetime of a run.
pub struct ChainPool {
    connector: Box<dyn ChainConnector>,
    handles: Mutex<HashMap<ChainId, Arc<dyn Chain>>>,
}

impl ChainPool {
    pub fn new(connector: impl ChainConnector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, chain: ChainId) -> Result<Arc<dyn Chain>, ChainError> {
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(handle) = handles.get(&chain) {
            return Ok(Arc::clone(handle));
        }

        debug!(%chain, "Connecting to chain");
        let handle = self.connector.connect(chain)?;
        handles.insert(chain, Arc::clone(&handle));

        Ok(handle)
    }
}
