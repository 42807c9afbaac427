//! Bridge abstraction for cross-chain USDC transfers.
//!
//! The rebalancer bridges USDC with a burn/mint primitive: funds are burned
//! on the source chain, an off-chain attestation service signs the burn
//! message, and the message is replayed on the destination chain to mint.
//! This crate provides the two off-chain services that flow depends on:
//!
//! - [`FeeQuoter`]: minimum fee (basis points) for a route.
//! - [`AttestationSource`]: blocking, bounded retrieval of the attestation
//!   for a burn transaction.
//!
//! The default (no features) build ships only the traits and shared domain
//! types. Enable the `cctp` feature for the Circle Iris API implementation.

use alloy::primitives::{Bytes, TxHash};
use async_trait::async_trait;
use rust_decimal::Decimal;

#[cfg(feature = "cctp")]
pub mod cctp;

/// Source and destination CCTP domains of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeRoute {
    pub source_domain: u32,
    pub destination_domain: u32,
}

/// Signed burn message required to mint on the destination chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    /// Message bytes emitted by the burn, as returned by the attestation API.
    pub message: Bytes,
    /// Attestation signature over `message`.
    pub attestation: Bytes,
}

/// Maps an EVM chain id to its CCTP domain.
///
/// Testnets share the domain of their mainnet.
pub const fn cctp_domain(chain_id: u64) -> Option<u32> {
    match chain_id {
        1 | 11_155_111 => Some(0),
        10 | 11_155_420 => Some(2),
        42_161 | 421_614 => Some(3),
        8_453 | 84_532 => Some(6),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[cfg(feature = "cctp")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("fee endpoint returned HTTP {status}")]
    FeeEndpoint { status: u16 },
    #[error("no fee quoted for finality threshold {finality_threshold} on {route:?}")]
    FeeNotAvailable {
        route: BridgeRoute,
        finality_threshold: u32,
    },
    #[cfg(feature = "cctp")]
    #[error("attestation timeout after {attempts} attempts: {source}")]
    AttestationTimeout {
        attempts: usize,
        source: cctp::AttestationError,
    },
}

impl BridgeError {
    /// Whether retrying the same request can succeed.
    ///
    /// An attestation timeout already spent its own polling budget, so it
    /// is final.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "cctp")]
            Self::Http(_) => true,
            Self::FeeEndpoint { status } => *status >= 500 || *status == 429,
            Self::FeeNotAvailable { .. } => false,
            #[cfg(feature = "cctp")]
            Self::AttestationTimeout { .. } => false,
        }
    }
}

/// Quotes the minimum bridge fee for a route.
#[async_trait]
pub trait FeeQuoter: Send + Sync {
    /// Minimum fee in basis points for transfers at `finality_threshold`.
    async fn minimum_fee_bps(
        &self,
        route: BridgeRoute,
        finality_threshold: u32,
    ) -> Result<Decimal, BridgeError>;
}

/// Retrieves attestations for burn transactions.
#[async_trait]
pub trait AttestationSource: Send + Sync {
    /// Blocks until the attestation for `burn_tx` is available or the
    /// implementation's polling budget is exhausted.
    async fn retrieve_attestation(
        &self,
        source_domain: u32,
        burn_tx: TxHash,
    ) -> Result<Attestation, BridgeError>;
}

#[async_trait]
impl<T: FeeQuoter + ?Sized> FeeQuoter for std::sync::Arc<T> {
    async fn minimum_fee_bps(
        &self,
        route: BridgeRoute,
        finality_threshold: u32,
    ) -> Result<Decimal, BridgeError> {
        (**self).minimum_fee_bps(route, finality_threshold).await
    }
}

#[async_trait]
impl<T: AttestationSource + ?Sized> AttestationSource for std::sync::Arc<T> {
    async fn retrieve_attestation(
        &self,
        source_domain: u32,
        burn_tx: TxHash,
    ) -> Result<Attestation, BridgeError> {
        (**self).retrieve_attestation(source_domain, burn_tx).await
    }
}
