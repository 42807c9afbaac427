//! In-memory ledger, chains and bridge for tests.
//!
//! [`World`] holds token balances for every chain. Signed transactions
//! produced by [`MockLedger`] are the JSON of what was signed, so
//! [`InMemoryChain::broadcast`] can decode them and apply their effect.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, Bytes, TxHash, U256, address, keccak256};
use alloy::transports::TransportErrorKind;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use treasury_bridge::cctp::AttestationError;
use treasury_bridge::{Attestation, AttestationSource, BridgeError, BridgeRoute, FeeQuoter};
use treasury_evm::{Chain, EvmError, LendingReserve};

use crate::chain::{
    CctpConfig, ChainConfig, ChainConnector, ChainError, ChainId, LendingConfig, VaultConfig,
};
use crate::ledger::{LedgerClient, LedgerError, LedgerOutcome, LedgerReader, RemoteCall};

pub(crate) const AGENT: Address = address!("0xa9e0000000000000000000000000000000000001");
pub(crate) const VAULT: Address = address!("0x7a17000000000000000000000000000000000002");
pub(crate) const USDC: Address = address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
pub(crate) const POOL: Address = address!("0xA238Dd80C259a72e81d7e4664a9801593F98d1c5");
pub(crate) const RECEIPT: Address = address!("0x4e65fE4DbA92790696d040ac24Aa414708F5c0AB");
pub(crate) const MESSENGER: Address = address!("0x28b5a0e9C621a5BadaA536219b3a228C8168cf5d");
pub(crate) const TRANSMITTER: Address = address!("0x81D40F21F12A8F0E3252Bccb954D722d4c464B64");

const RAY_PER_PERCENT: f64 = 1e25;

/// Ledger configuration for `chains`, with the vault on `home` only.
pub(crate) fn configs(home: ChainId, chains: &[ChainId]) -> BTreeMap<ChainId, ChainConfig> {
    chains
        .iter()
        .map(|&chain| {
            let vault_address = if chain == home {
                VAULT.to_string()
            } else {
                String::new()
            };

            let config = ChainConfig {
                aave: LendingConfig {
                    asset: USDC,
                    on_behalf_of: AGENT,
                    referral_code: 0,
                    lending_pool_address: POOL,
                },
                cctp: CctpConfig {
                    messenger_address: MESSENGER,
                    transmitter_address: TRANSMITTER,
                    usdc_address: USDC,
                },
                rebalancer: VaultConfig { vault_address },
            };

            (chain, config)
        })
        .collect()
}

/// A reserve paying `rate_percent`, with a 4% first slope at 90% optimal
/// usage.
pub(crate) fn reserve(rate_percent: f64, total_supply: u128, total_borrow: u128) -> LendingReserve {
    let ray = |percent: f64| U256::from((percent * RAY_PER_PERCENT) as u128);

    LendingReserve {
        receipt_token: RECEIPT,
        liquidity_rate: ray(rate_percent),
        total_supply: U256::from(total_supply),
        total_borrow: U256::from(total_borrow),
        variable_rate_slope1: ray(4.0),
        optimal_usage_ratio: ray(90.0),
    }
}

#[derive(Default)]
struct State {
    /// (chain, token, holder) -> balance
    balances: HashMap<(ChainId, Address, Address), U256>,
    /// (chain, token, spender) -> allowance granted by the agent
    allowances: HashMap<(ChainId, Address, Address), U256>,
    markets: HashMap<ChainId, LendingReserve>,
    /// (recipient, amount) per burn not yet minted
    pending_mints: VecDeque<(Address, U256)>,
    broadcasts: Vec<(ChainId, &'static str)>,
    swallowed: HashSet<&'static str>,
    failing_broadcasts: usize,
}

impl State {
    fn balance(&mut self, chain: ChainId, token: Address, holder: Address) -> &mut U256 {
        self.balances.entry((chain, token, holder)).or_default()
    }

    fn debit(&mut self, chain: ChainId, token: Address, holder: Address, amount: U256) -> bool {
        let balance = self.balance(chain, token, holder);
        match balance.checked_sub(amount) {
            Some(remaining) => {
                *balance = remaining;
                true
            }
            None => false,
        }
    }

    fn credit(&mut self, chain: ChainId, token: Address, holder: Address, amount: U256) {
        *self.balance(chain, token, holder) += amount;
    }

    fn spend_allowance(
        &mut self,
        chain: ChainId,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> bool {
        let allowance = self.allowances.entry((chain, token, spender)).or_default();
        match allowance.checked_sub(amount) {
            Some(remaining) => {
                *allowance = remaining;
                true
            }
            None => false,
        }
    }

    /// Applies `call` as sent by `agent`. Returns false if it would revert.
    fn apply(&mut self, chain: ChainId, agent: Address, call: &RemoteCall) -> bool {
        match *call {
            RemoteCall::VaultWithdraw { vault, amount } => {
                self.debit(chain, RECEIPT, vault, amount) && {
                    self.credit(chain, USDC, agent, amount);
                    true
                }
            }
            RemoteCall::VaultDeposit { vault, amount } => {
                self.spend_allowance(chain, USDC, vault, amount)
                    && self.debit(chain, USDC, agent, amount)
                    && {
                        self.credit(chain, RECEIPT, vault, amount);
                        true
                    }
            }
            RemoteCall::Approve {
                token,
                spender,
                amount,
            } => {
                self.allowances.insert((chain, token, spender), amount);
                true
            }
            RemoteCall::CctpBurn {
                messenger,
                burn_token,
                amount,
                mint_recipient,
                max_fee,
                ..
            } => {
                amount > max_fee
                    && self.spend_allowance(chain, burn_token, messenger, amount)
                    && self.debit(chain, burn_token, agent, amount)
                    && {
                        self.pending_mints
                            .push_back((mint_recipient, amount - max_fee));
                        true
                    }
            }
            RemoteCall::CctpMint { .. } => match self.pending_mints.pop_front() {
                Some((recipient, amount)) => {
                    self.credit(chain, USDC, recipient, amount);
                    true
                }
                None => false,
            },
            RemoteCall::LendingSupply {
                pool,
                asset,
                amount,
                on_behalf_of,
                ..
            } => {
                self.spend_allowance(chain, asset, pool, amount)
                    && self.debit(chain, asset, agent, amount)
                    && {
                        self.credit(chain, RECEIPT, on_behalf_of, amount);
                        true
                    }
            }
            RemoteCall::LendingWithdraw {
                asset, amount, to, ..
            } => {
                self.debit(chain, RECEIPT, agent, amount) && {
                    self.credit(chain, asset, to, amount);
                    true
                }
            }
        }
    }
}

pub(crate) const fn call_kind(call: &RemoteCall) -> &'static str {
    match call {
        RemoteCall::VaultWithdraw { .. } => "vault_withdraw",
        RemoteCall::VaultDeposit { .. } => "vault_deposit",
        RemoteCall::Approve { .. } => "approve",
        RemoteCall::CctpBurn { .. } => "cctp_burn",
        RemoteCall::CctpMint { .. } => "cctp_mint",
        RemoteCall::LendingSupply { .. } => "lending_supply",
        RemoteCall::LendingWithdraw { .. } => "lending_withdraw",
    }
}

/// Token balances and lending markets across every chain of a test.
#[derive(Clone)]
pub(crate) struct World {
    agent: Address,
    state: Arc<Mutex<State>>,
}

impl World {
    pub(crate) fn new(agent: Address) -> Self {
        Self {
            agent,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub(crate) fn chain(&self, chain: ChainId) -> InMemoryChain {
        InMemoryChain {
            chain,
            world: self.clone(),
        }
    }

    pub(crate) fn add_market(&self, chain: ChainId, reserve: LendingReserve) {
        self.state.lock().unwrap().markets.insert(chain, reserve);
    }

    pub(crate) fn set_balance(
        &self,
        chain: ChainId,
        token: Address,
        holder: Address,
        amount: u128,
    ) {
        *self.state.lock().unwrap().balance(chain, token, holder) = U256::from(amount);
    }

    pub(crate) fn balance(&self, chain: ChainId, token: Address, holder: Address) -> u128 {
        let balance = *self.state.lock().unwrap().balance(chain, token, holder);
        u128::try_from(balance).unwrap()
    }

    /// Broadcasts of `kind` are mined but change nothing.
    pub(crate) fn swallow_effects(&self, kind: &'static str) {
        self.state.lock().unwrap().swallowed.insert(kind);
    }

    /// The next `count` broadcasts fail with a transport error.
    pub(crate) fn fail_next_broadcasts(&self, count: usize) {
        self.state.lock().unwrap().failing_broadcasts = count;
    }

    /// Kinds of the calls mined so far, in order.
    pub(crate) fn broadcasts(&self) -> Vec<&'static str> {
        self.state
            .lock()
            .unwrap()
            .broadcasts
            .iter()
            .map(|(_, kind)| *kind)
            .collect()
    }

    pub(crate) fn broadcasts_on(&self, chain: ChainId) -> Vec<&'static str> {
        self.state
            .lock()
            .unwrap()
            .broadcasts
            .iter()
            .filter(|(on, _)| *on == chain)
            .map(|(_, kind)| *kind)
            .collect()
    }
}

impl ChainConnector for World {
    fn connect(&self, chain: ChainId) -> Result<Arc<dyn Chain>, ChainError> {
        Ok(Arc::new(self.chain(chain)))
    }
}

#[derive(Deserialize)]
struct SignedCall {
    chain_id: ChainId,
    call: RemoteCall,
}

fn unreachable_node(reason: &str) -> EvmError {
    EvmError::Transport(TransportErrorKind::custom_str(reason))
}

/// One chain's view of a [`World`].
pub(crate) struct InMemoryChain {
    chain: ChainId,
    world: World,
}

#[async_trait]
impl Chain for InMemoryChain {
    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, EvmError> {
        Ok(*self.world.state.lock().unwrap().balance(self.chain, token, holder))
    }

    async fn receipt_token(
        &self,
        lending_pool: Address,
        asset: Address,
    ) -> Result<Address, EvmError> {
        self.lending_reserve(lending_pool, asset)
            .await
            .map(|reserve| reserve.receipt_token)
    }

    async fn lending_reserve(
        &self,
        lending_pool: Address,
        asset: Address,
    ) -> Result<LendingReserve, EvmError> {
        let state = self.world.state.lock().unwrap();

        match state.markets.get(&self.chain) {
            Some(reserve) if lending_pool == POOL && asset == USDC => Ok(*reserve),
            _ => Err(unreachable_node("no lending reserve")),
        }
    }

    async fn broadcast(&self, signed_tx: &Bytes, _note: &str) -> Result<TxHash, EvmError> {
        let tx_hash = keccak256(signed_tx);
        let mut state = self.world.state.lock().unwrap();

        if state.failing_broadcasts > 0 {
            state.failing_broadcasts -= 1;
            return Err(unreachable_node("connection reset"));
        }

        let signed: SignedCall = serde_json::from_slice(signed_tx).unwrap();
        let kind = call_kind(&signed.call);

        if signed.chain_id != self.chain {
            return Err(EvmError::Reverted { tx_hash });
        }

        if !state.swallowed.contains(kind)
            && !state.apply(self.chain, self.world.agent, &signed.call)
        {
            return Err(EvmError::Reverted { tx_hash });
        }

        state.broadcasts.push((self.chain, kind));

        Ok(tx_hash)
    }
}

/// Rebalancer contract double. Signing returns the JSON of the signed
/// arguments.
pub(crate) struct MockLedger {
    home: ChainId,
    configs: Vec<(ChainId, ChainConfig)>,
    next_nonce: AtomicU64,
    submissions: Mutex<Vec<(String, Value)>>,
    rejection: Mutex<Option<String>>,
    transient_failures: AtomicUsize,
}

impl MockLedger {
    pub(crate) fn new() -> Self {
        Self::with_configs(ChainId(8453), BTreeMap::new())
    }

    pub(crate) fn with_configs(home: ChainId, configs: BTreeMap<ChainId, ChainConfig>) -> Self {
        Self {
            home,
            configs: configs.into_iter().collect(),
            next_nonce: AtomicU64::new(0),
            submissions: Mutex::new(Vec::new()),
            rejection: Mutex::new(None),
            transient_failures: AtomicUsize::new(0),
        }
    }

    /// The next submission fails on the ledger with `reason`.
    pub(crate) fn reject_next(&self, reason: &str) {
        *self.rejection.lock().unwrap() = Some(reason.to_owned());
    }

    /// The next `count` submissions fail with an RPC error.
    pub(crate) fn fail_next_submissions(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn last_submission(&self) -> Option<(String, Value)> {
        self.submissions.lock().unwrap().last().cloned()
    }

    /// Methods submitted so far, in order.
    pub(crate) fn submitted_methods(&self) -> Vec<String> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }
}

#[async_trait]
impl LedgerReader for MockLedger {
    async fn view(&self, method: &str, _args: Value) -> Result<Vec<u8>, LedgerError> {
        match method {
            "get_source_chain" => Ok(serde_json::to_vec(&self.home)?),
            "get_all_configs" => Ok(serde_json::to_vec(&self.configs)?),
            _ => Err(LedgerError::CallFailed {
                method: method.to_owned(),
                reason: "MethodNotFound".to_owned(),
            }),
        }
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn submit(&self, method: &str, args: Value) -> Result<LedgerOutcome, LedgerError> {
        self.submissions
            .lock()
            .unwrap()
            .push((method.to_owned(), args.clone()));

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerError::Rpc("request timed out".to_owned()));
        }

        if let Some(reason) = self.rejection.lock().unwrap().take() {
            return Ok(LedgerOutcome::Failure(reason));
        }

        let value = match method {
            "start_rebalance" => {
                serde_json::to_vec(&self.next_nonce.fetch_add(1, Ordering::SeqCst))?
            }
            "complete_rebalance" => b"null".to_vec(),
            builder if builder.starts_with("build_and_sign_") => {
                serde_json::to_vec(&serde_json::to_vec(&args)?)?
            }
            _ => return Ok(LedgerOutcome::Failure("MethodNotFound".to_owned())),
        };

        Ok(LedgerOutcome::Success(value))
    }
}

/// Fee quoter and attestation source with a fixed fee and instant
/// attestations.
pub(crate) struct MockBridge {
    fee_bps: Decimal,
    fee_calls: AtomicUsize,
    transient_fee_failures: AtomicUsize,
    attestation_calls: AtomicUsize,
    attestation_unavailable: AtomicBool,
}

impl MockBridge {
    pub(crate) fn new(fee_bps: Decimal) -> Self {
        Self {
            fee_bps,
            fee_calls: AtomicUsize::new(0),
            transient_fee_failures: AtomicUsize::new(0),
            attestation_calls: AtomicUsize::new(0),
            attestation_unavailable: AtomicBool::new(false),
        }
    }

    /// The next `count` fee quotes fail with HTTP 503.
    pub(crate) fn fail_next_fee_quotes(&self, count: usize) {
        self.transient_fee_failures.store(count, Ordering::SeqCst);
    }

    /// Every attestation request times out.
    pub(crate) fn withhold_attestations(&self) {
        self.attestation_unavailable.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_attestations(&self) {
        self.attestation_unavailable.store(false, Ordering::SeqCst);
    }

    pub(crate) fn fee_calls(&self) -> usize {
        self.fee_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn attestation_calls(&self) -> usize {
        self.attestation_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeeQuoter for MockBridge {
    async fn minimum_fee_bps(
        &self,
        _route: BridgeRoute,
        _finality_threshold: u32,
    ) -> Result<Decimal, BridgeError> {
        self.fee_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.transient_fee_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_fee_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BridgeError::FeeEndpoint { status: 503 });
        }

        Ok(self.fee_bps)
    }
}

#[async_trait]
impl AttestationSource for MockBridge {
    async fn retrieve_attestation(
        &self,
        _source_domain: u32,
        burn_tx: TxHash,
    ) -> Result<Attestation, BridgeError> {
        self.attestation_calls.fetch_add(1, Ordering::SeqCst);

        if self.attestation_unavailable.load(Ordering::SeqCst) {
            return Err(BridgeError::AttestationTimeout {
                attempts: 60,
                source: AttestationError::Pending {
                    status: "pending_confirmations".to_owned(),
                },
            });
        }

        Ok(Attestation {
            message: Bytes::copy_from_slice(burn_tx.as_slice()),
            attestation: Bytes::from_static(b"attested"),
        })
    }
}
