//! Home ledger access.
//!
//! The rebalancer contract on the home ledger holds the per-chain
//! configuration, opens and closes rebalance sessions, and signs every
//! remote-chain transaction the agent broadcasts (threshold signing). This
//! module models it in two layers:
//!
//! - [`LedgerReader`] / [`LedgerClient`]: untyped `view` and `submit` calls
//!   with JSON arguments and raw return bytes.
//! - [`RebalancerContract`]: the typed methods the agent uses.
//!
//! [`NearRpcLedger`] implements [`LedgerReader`] over NEAR JSON-RPC. Signed
//! submission needs the agent's ledger account key and is provided by the
//! embedding application.

use std::collections::BTreeMap;

use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use crate::chain::{ChainConfig, ChainId};
use crate::flow::Flow;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ledger RPC error: {0}")]
    Rpc(String),
    #[error("failed to decode ledger response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid base64 in ledger response: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ledger call {method} failed: {reason}")]
    CallFailed { method: String, reason: String },
}

impl LedgerError {
    /// Transport problems are transient. A contract rejecting a call is not.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Rpc(_))
    }
}

/// Result of a submitted ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// JSON-encoded return value of the called method.
    Success(Vec<u8>),
    Failure(String),
}

/// Read-only ledger calls.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// Calls a view method and returns its JSON-encoded result.
    async fn view(&self, method: &str, args: serde_json::Value) -> Result<Vec<u8>, LedgerError>;
}

/// Ledger calls that change state, signed by the agent's ledger account.
#[async_trait]
pub trait LedgerClient: LedgerReader {
    async fn submit(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<LedgerOutcome, LedgerError>;
}

#[async_trait]
impl<T: LedgerReader + ?Sized> LedgerReader for &T {
    async fn view(&self, method: &str, args: serde_json::Value) -> Result<Vec<u8>, LedgerError> {
        (**self).view(method, args).await
    }
}

#[async_trait]
impl<T: LedgerClient + ?Sized> LedgerClient for &T {
    async fn submit(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<LedgerOutcome, LedgerError> {
        (**self).submit(method, args).await
    }
}

#[async_trait]
impl<T: LedgerReader + ?Sized> LedgerReader for std::sync::Arc<T> {
    async fn view(&self, method: &str, args: serde_json::Value) -> Result<Vec<u8>, LedgerError> {
        (**self).view(method, args).await
    }
}

#[async_trait]
impl<T: LedgerClient + ?Sized> LedgerClient for std::sync::Arc<T> {
    async fn submit(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<LedgerOutcome, LedgerError> {
        (**self).submit(method, args).await
    }
}

/// A remote-chain call for the ledger to build and sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteCall {
    /// Pull funds out of the home vault to the agent.
    VaultWithdraw { vault: Address, amount: U256 },
    /// Return funds from the agent to the home vault.
    VaultDeposit { vault: Address, amount: U256 },
    Approve {
        token: Address,
        spender: Address,
        amount: U256,
    },
    CctpBurn {
        messenger: Address,
        burn_token: Address,
        amount: U256,
        destination_domain: u32,
        mint_recipient: Address,
        max_fee: U256,
        min_finality_threshold: u32,
    },
    CctpMint {
        transmitter: Address,
        message: Bytes,
        attestation: Bytes,
    },
    LendingSupply {
        pool: Address,
        asset: Address,
        amount: U256,
        on_behalf_of: Address,
        referral_code: u16,
    },
    LendingWithdraw {
        pool: Address,
        asset: Address,
        amount: U256,
        to: Address,
    },
}

impl RemoteCall {
    /// Ledger method that builds and signs this call.
    pub const fn builder_method(&self) -> &'static str {
        match self {
            Self::VaultWithdraw { .. } => "build_and_sign_withdraw_for_crosschain_allocation_tx",
            Self::VaultDeposit { .. } => "build_and_sign_rebalancer_deposit_tx",
            Self::Approve { .. } => "build_and_sign_approve_tx",
            Self::CctpBurn { .. } => "build_and_sign_cctp_burn_tx",
            Self::CctpMint { .. } => "build_and_sign_cctp_mint_tx",
            Self::LendingSupply { .. } => "build_and_sign_aave_supply_tx",
            Self::LendingWithdraw { .. } => "build_and_sign_aave_withdraw_tx",
        }
    }
}

/// Broadcast-ready signed transaction bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction(pub Bytes);

/// Typed access to the rebalancer contract.
pub struct RebalancerContract<L> {
    client: L,
}

impl<L> RebalancerContract<L> {
    pub const fn new(client: L) -> Self {
        Self { client }
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LedgerError> {
    Ok(serde_json::from_slice(bytes)?)
}

impl<L: LedgerReader> RebalancerContract<L> {
    /// Chain that holds the vault.
    pub async fn source_chain(&self) -> Result<ChainId, LedgerError> {
        decode(&self.client.view("get_source_chain", json!({})).await?)
    }

    pub async fn all_configs(&self) -> Result<BTreeMap<ChainId, ChainConfig>, LedgerError> {
        let configs: Vec<(ChainId, ChainConfig)> =
            decode(&self.client.view("get_all_configs", json!({})).await?)?;

        Ok(configs.into_iter().collect())
    }
}

impl<L: LedgerClient> RebalancerContract<L> {
    async fn submit(&self, method: &str, args: serde_json::Value) -> Result<Vec<u8>, LedgerError> {
        match self.client.submit(method, args).await? {
            LedgerOutcome::Success(value) => Ok(value),
            LedgerOutcome::Failure(reason) => Err(LedgerError::CallFailed {
                method: method.to_owned(),
                reason,
            }),
        }
    }

    /// Opens a rebalance session and returns its nonce.
    pub async fn start_rebalance(
        &self,
        flow: Flow,
        from: ChainId,
        to: ChainId,
        amount: u128,
    ) -> Result<u64, LedgerError> {
        let args = json!({
            "flow": flow.ledger_name(),
            "source_chain": from,
            "destination_chain": to,
            "expected_amount": amount.to_string(),
        });

        let nonce = decode(&self.submit("start_rebalance", args).await?)?;
        info!(%flow, %from, %to, amount, nonce, "Rebalance session started");

        Ok(nonce)
    }

    pub async fn complete_rebalance(&self, nonce: u64) -> Result<(), LedgerError> {
        self.submit("complete_rebalance", json!({ "nonce": nonce }))
            .await?;
        info!(nonce, "Rebalance session completed");

        Ok(())
    }

    /// Has the ledger build and sign `call` for `chain`.
    pub async fn sign(
        &self,
        chain: ChainId,
        call: &RemoteCall,
    ) -> Result<SignedTransaction, LedgerError> {
        let method = call.builder_method();
        let args = json!({ "chain_id": chain, "call": call });

        let signed: Vec<u8> = decode(&self.submit(method, args).await?)?;
        debug!(method, %chain, len = signed.len(), "Ledger signed transaction");

        Ok(SignedTransaction(Bytes::from(signed)))
    }
}

/// [`LedgerReader`] over NEAR JSON-RPC `call_function` queries.
pub struct NearRpcLedger {
    http_client: reqwest::Client,
    rpc_url: Url,
    contract_id: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<CallResult>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct CallResult {
    #[serde(default)]
    result: Option<Vec<u8>>,
    #[serde(default)]
    error: Option<String>,
}

impl NearRpcLedger {
    pub fn new(rpc_url: Url, contract_id: String) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            rpc_url,
            contract_id,
        }
    }
}

#[async_trait]
impl LedgerReader for NearRpcLedger {
    async fn view(&self, method: &str, args: serde_json::Value) -> Result<Vec<u8>, LedgerError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": "rebalancer",
            "method": "query",
            "params": {
                "request_type": "call_function",
                "finality": "final",
                "account_id": self.contract_id,
                "method_name": method,
                "args_base64": BASE64.encode(serde_json::to_vec(&args)?),
            }
        });

        let response: RpcResponse = self
            .http_client
            .post(self.rpc_url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(LedgerError::Rpc(error.to_string()));
        }

        let result = response
            .result
            .ok_or_else(|| LedgerError::Rpc("response has neither result nor error".to_owned()))?;

        if let Some(reason) = result.error {
            return Err(LedgerError::CallFailed {
                method: method.to_owned(),
                reason,
            });
        }

        result.result.ok_or_else(|| LedgerError::CallFailed {
            method: method.to_owned(),
            reason: "view call returned no value".to_owned(),
        })
    }
}
