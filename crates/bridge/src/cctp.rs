//! Circle Iris API client for CCTP V2 fee quotes and attestations.
//!
//! Two endpoints are used:
//!
//! - `GET /v2/burn/USDC/fees/{source}/{destination}` returns one fee entry
//!   per finality threshold (1000 = fast transfer, 2000 = standard).
//! - `GET /v2/messages/{source}?transactionHash={tx}` returns the burn
//!   message and, once Circle has signed it, the attestation.
//!
//! Attestation retrieval is a bounded constant-interval poll: at most
//! `max_attempts` requests spaced `interval` apart, then
//! [`BridgeError::AttestationTimeout`].

use std::time::Duration;

use alloy::primitives::{Bytes, TxHash};
use async_trait::async_trait;
use backon::Retryable;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{Attestation, AttestationSource, BridgeError, BridgeRoute, FeeQuoter};

pub const CIRCLE_API_BASE: &str = "https://iris-api.circle.com";

/// Bounds on attestation polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttestationPolling {
    pub max_attempts: usize,
    pub interval: Duration,
}

impl Default for AttestationPolling {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_secs(5),
        }
    }
}

/// Errors from a single attestation poll attempt.
#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid hex encoding: {0}")]
    HexDecode(#[from] alloy::hex::FromHexError),
    #[error("Attestation pending: {status}")]
    Pending { status: String },
    #[error("No messages in attestation response")]
    NoMessages,
    #[error("Attestation response missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("Attestation not yet available (HTTP {status})")]
    NotYetAvailable { status: u16 },
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct FeeEntry {
    finality_threshold: u32,
    minimum_fee: Decimal,
}

#[derive(Deserialize, Debug)]
struct MessagesResponse {
    messages: Vec<MessageEntry>,
}

#[derive(Deserialize, Debug)]
struct MessageEntry {
    attestation: Option<String>,
    message: Option<String>,
    status: String,
}

/// Fee quoter and attestation source backed by Circle's Iris API.
#[derive(Debug, Clone)]
pub struct CircleIris {
    http_client: reqwest::Client,
    api_base: String,
    polling: AttestationPolling,
}

impl CircleIris {
    pub fn new(
        api_base: impl Into<String>,
        polling: AttestationPolling,
    ) -> Result<Self, BridgeError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http_client,
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            polling,
        })
    }

    async fn fetch_attestation(&self, url: &str) -> Result<Attestation, AttestationError> {
        let response = self.http_client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(AttestationError::NotYetAvailable {
                status: response.status().as_u16(),
            });
        }

        let body: MessagesResponse = response.json().await?;
        let entry = body.messages.first().ok_or(AttestationError::NoMessages)?;

        if entry.status != "complete" {
            return Err(AttestationError::Pending {
                status: entry.status.clone(),
            });
        }

        let message_hex = entry
            .message
            .as_ref()
            .ok_or(AttestationError::MissingField { field: "message" })?;
        let attestation_hex = entry
            .attestation
            .as_ref()
            .ok_or(AttestationError::MissingField {
                field: "attestation",
            })?;

        Ok(Attestation {
            message: Bytes::from(alloy::hex::decode(message_hex)?),
            attestation: Bytes::from(alloy::hex::decode(attestation_hex)?),
        })
    }
}

#[async_trait]
impl FeeQuoter for CircleIris {
    async fn minimum_fee_bps(
        &self,
        route: BridgeRoute,
        finality_threshold: u32,
    ) -> Result<Decimal, BridgeError> {
        let url = format!(
            "{}/v2/burn/USDC/fees/{}/{}",
            self.api_base, route.source_domain, route.destination_domain
        );
        let response = self.http_client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            warn!(url, status, "Fee endpoint failed");
            return Err(BridgeError::FeeEndpoint { status });
        }

        let entries: Vec<FeeEntry> = response.json().await?;

        let minimum_fee = entries
            .iter()
            .find(|entry| entry.finality_threshold == finality_threshold)
            .ok_or(BridgeError::FeeNotAvailable {
                route,
                finality_threshold,
            })?
            .minimum_fee;

        debug!(?route, finality_threshold, %minimum_fee, "Retrieved bridge fee");

        Ok(minimum_fee)
    }
}

#[async_trait]
impl AttestationSource for CircleIris {
    async fn retrieve_attestation(
        &self,
        source_domain: u32,
        burn_tx: TxHash,
    ) -> Result<Attestation, BridgeError> {
        let url = format!(
            "{}/v2/messages/{source_domain}?transactionHash={burn_tx}",
            self.api_base
        );

        info!(%url, max_attempts = self.polling.max_attempts, "Polling attestation API");

        let backoff = backon::ConstantBuilder::default()
            .with_delay(self.polling.interval)
            .with_max_times(self.polling.max_attempts.saturating_sub(1));

        (|| self.fetch_attestation(&url))
            .retry(backoff)
            .notify(|err, dur| match err {
                AttestationError::Pending { status } => {
                    info!(%status, ?dur, "Attestation pending, retrying");
                }
                AttestationError::NotYetAvailable { status } => {
                    debug!(status, ?dur, "API non-success, retrying");
                }
                err => warn!(?err, ?dur, "Attestation error, retrying"),
            })
            .await
            .map_err(|source| BridgeError::AttestationTimeout {
                attempts: self.polling.max_attempts,
                source,
            })
    }
}
