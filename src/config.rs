use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::Address;
use clap::Parser;
use serde::Deserialize;
use tracing::Level;
use treasury_bridge::cctp::{AttestationPolling, CIRCLE_API_BASE};
use url::Url;

use crate::chain::{ChainId, ChainPool, RpcConnector};
use crate::orchestrator::FailurePolicy;
use crate::saga::BridgeSettings;

#[derive(Parser, Debug)]
pub struct Env {
    /// Path to plaintext TOML configuration file
    #[clap(long)]
    pub config: PathBuf,
    /// Path to TOML secrets file (RPC endpoints)
    #[clap(long)]
    pub secrets: PathBuf,
}

/// Non-secret settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
struct Config {
    log_level: Option<LogLevel>,
    agent_address: Address,
    ledger: LedgerConfig,
    required_confirmations: Option<u64>,
    on_failure: Option<FailurePolicy>,
    #[serde(default)]
    bridge: BridgeConfig,
    #[serde(default)]
    saga: SagaConfig,
    /// Supply rate in percent per chain id, replacing the on-chain rate.
    #[serde(default)]
    interest_rate_overrides: BTreeMap<String, f64>,
}

#[derive(Deserialize)]
struct LedgerConfig {
    rpc_url: Url,
    contract_id: String,
}

#[derive(Deserialize, Default)]
struct BridgeConfig {
    api_base: Option<String>,
    /// USDC base units. TOML integers are 64-bit.
    max_bridge_fee: Option<u64>,
    min_finality_threshold: Option<u32>,
    attestation_max_attempts: Option<usize>,
    attestation_interval_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct SagaConfig {
    step_attempts: Option<usize>,
    step_retry_delay_ms: Option<u64>,
}

/// Secrets deserialized from the secrets TOML.
#[derive(Deserialize)]
struct Secrets {
    /// JSON-RPC endpoint per chain id. Provider URLs embed API keys.
    rpc_urls: HashMap<String, Url>,
}

// ===== Runtime types (assembled from Config + Secrets) =====

#[derive(Debug, Clone)]
pub struct LedgerCtx {
    pub rpc_url: Url,
    pub contract_id: String,
}

#[derive(Debug, Clone)]
pub struct BridgeCtx {
    pub api_base: String,
    pub settings: BridgeSettings,
    pub polling: AttestationPolling,
}

#[derive(Debug, Clone)]
pub struct SagaCtx {
    pub step_attempts: usize,
    pub step_retry_delay: Duration,
}

/// Runtime context assembled from the plaintext config and the secrets.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub log_level: LogLevel,
    pub agent: Address,
    pub ledger: LedgerCtx,
    pub rpc_urls: HashMap<ChainId, Url>,
    pub required_confirmations: u64,
    pub bridge: BridgeCtx,
    pub saga: SagaCtx,
    pub on_failure: FailurePolicy,
    pub interest_rate_overrides: BTreeMap<ChainId, f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        (&log_level).into()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error("invalid chain id {0:?}")]
    InvalidChainId(String),
    #[error("saga.step_attempts must be at least 1")]
    ZeroStepAttempts,
    #[error("bridge.attestation_max_attempts must be at least 1")]
    ZeroAttestationAttempts,
}

fn chain_keyed<V>(
    entries: impl IntoIterator<Item = (String, V)>,
) -> Result<Vec<(ChainId, V)>, ConfigError> {
    entries
        .into_iter()
        .map(|(key, value)| {
            key.trim()
                .parse::<u64>()
                .map(|id| (ChainId(id), value))
                .map_err(|_| ConfigError::InvalidChainId(key))
        })
        .collect()
}

impl Ctx {
    pub fn load_files(config: &Path, secrets: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(config)?;
        let secrets_str = std::fs::read_to_string(secrets)?;
        Self::from_toml(&config_str, &secrets_str)
    }

    pub fn from_toml(config_toml: &str, secrets_toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_toml)?;
        let secrets: Secrets = toml::from_str(secrets_toml)?;

        let step_attempts = config.saga.step_attempts.unwrap_or(3);
        if step_attempts == 0 {
            return Err(ConfigError::ZeroStepAttempts);
        }

        let polling = AttestationPolling {
            max_attempts: config.bridge.attestation_max_attempts.unwrap_or(60),
            interval: Duration::from_secs(config.bridge.attestation_interval_secs.unwrap_or(5)),
        };
        if polling.max_attempts == 0 {
            return Err(ConfigError::ZeroAttestationAttempts);
        }

        let bridge = BridgeCtx {
            api_base: config
                .bridge
                .api_base
                .unwrap_or_else(|| CIRCLE_API_BASE.to_owned()),
            settings: BridgeSettings {
                max_bridge_fee: config.bridge.max_bridge_fee.map_or(990_000, u128::from),
                min_finality_threshold: config.bridge.min_finality_threshold.unwrap_or(1000),
            },
            polling,
        };

        Ok(Self {
            log_level: config.log_level.unwrap_or(LogLevel::Debug),
            agent: config.agent_address,
            ledger: LedgerCtx {
                rpc_url: config.ledger.rpc_url,
                contract_id: config.ledger.contract_id,
            },
            rpc_urls: chain_keyed(secrets.rpc_urls)?.into_iter().collect(),
            required_confirmations: config.required_confirmations.unwrap_or(1),
            bridge,
            saga: SagaCtx {
                step_attempts,
                step_retry_delay: Duration::from_millis(
                    config.saga.step_retry_delay_ms.unwrap_or(1000),
                ),
            },
            on_failure: config.on_failure.unwrap_or_default(),
            interest_rate_overrides: chain_keyed(config.interest_rate_overrides)?
                .into_iter()
                .collect(),
        })
    }

    /// Chain handles over the configured RPC endpoints.
    pub fn chain_pool(&self) -> ChainPool {
        ChainPool::new(RpcConnector::new(
            self.rpc_urls.clone(),
            self.required_confirmations,
        ))
    }
}

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter =
        format!("treasury_rebalancer={level},treasury_bridge={level},treasury_evm={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
