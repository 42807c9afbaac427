//! Multi-leg transfer execution.
//!
//! A transfer is a saga: a fixed sequence of [`Step`]s chosen by the
//! transfer's [`Flow`](crate::flow::Flow). Steps talk to the home ledger
//! (session bookkeeping and transaction signing), to the EVM chains on
//! both ends, and to the bridge's fee and attestation services. Between
//! legs, assertion steps re-read balances and abort the saga if funds are
//! not exactly where they should be.
//!
//! The pieces:
//!
//! - [`RunContext`]: everything one saga knows, filled in as steps complete.
//! - [`Step`] / [`StepRunner`]: the closed step set and the seam that runs
//!   one of them. [`StepLibrary`] is the production runner.
//! - [`StrategyTable`]: step sequence per flow.
//! - [`SagaExecutor`]: runs a strategy with bounded per-step retries and
//!   supports restarting from a named step.

mod context;
mod executor;
mod library;
mod step;
mod strategy;

pub use context::{
    Burn, ChainEndpoint, ContextField, DepositBaseline, FeeQuote, Mint, Preflight, Registration,
    Route, RouteError, RunContext, SupplyBaseline,
};
pub use executor::{SagaError, SagaExecutor, SagaFailure};
pub use library::{BridgeSettings, StepLibrary, compute_bridge_fee};
pub use step::{Step, StepError, StepRunner};
pub use strategy::{Strategy, StrategyTable};
