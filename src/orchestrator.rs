//! One rebalance pass: plan the transfers, then run a saga per transfer.

use std::collections::BTreeMap;
use std::fmt;

use alloy::primitives::Address;
use serde::Deserialize;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::chain::{ChainConfig, ChainId};
use crate::flow::{Flow, classify};
use crate::inventory::{self, Allocation};
use crate::optimizer::{MarketSnapshot, Optimization, optimize};
use crate::planner::{self, TransferOperation};
use crate::saga::{RouteError, RunContext, SagaExecutor, SagaFailure, StepRunner, StrategyTable};

/// What happens to the remaining transfers after one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure and run the next transfer.
    #[default]
    Continue,
    /// Skip every remaining transfer.
    Halt,
}

#[derive(Debug, Clone)]
pub struct RebalancePlan {
    pub optimization: Optimization,
    pub operations: Vec<TransferOperation>,
}

/// Optimizes the allocation across `snapshots` and derives the transfers
/// that move `current` to the optimum.
pub fn plan(current: &Allocation, snapshots: &[MarketSnapshot]) -> RebalancePlan {
    let optimization = optimize(inventory::total(current), snapshots);
    let operations = planner::plan(current, &optimization.target_allocations);

    info!(
        operations = operations.len(),
        current_avg_rate = optimization.current_avg_rate,
        projected_avg_rate = optimization.projected_avg_rate,
        converged = optimization.converged,
        "Planned rebalance"
    );

    RebalancePlan {
        optimization,
        operations,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("transfer {0} starts and ends on the same chain")]
    SameChain(TransferOperation),
    #[error("no strategy for flow {0}")]
    UnknownFlow(Flow),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Saga(#[from] Box<SagaFailure>),
}

#[derive(Debug)]
pub enum OperationOutcome {
    Completed(Box<RunContext>),
    Failed(OrchestratorError),
    /// Not attempted because an earlier transfer failed under
    /// [`FailurePolicy::Halt`].
    Skipped,
}

#[derive(Debug)]
pub struct OperationReport {
    pub operation: TransferOperation,
    pub outcome: OperationOutcome,
}

#[derive(Debug)]
pub struct RebalanceReport {
    pub run_id: Uuid,
    pub operations: Vec<OperationReport>,
}

impl RebalanceReport {
    fn count(&self, matches: impl Fn(&OperationOutcome) -> bool) -> usize {
        self.operations
            .iter()
            .filter(|report| matches(&report.outcome))
            .count()
    }

    pub fn completed(&self) -> usize {
        self.count(|outcome| matches!(outcome, OperationOutcome::Completed(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, OperationOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, OperationOutcome::Skipped))
    }
}

impl fmt::Display for RebalanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {}: {} completed, {} failed, {} skipped",
            self.run_id,
            self.completed(),
            self.failed(),
            self.skipped()
        )
    }
}

/// Runs transfers one at a time, each as the saga its flow calls for.
pub struct RebalanceOrchestrator<R> {
    executor: SagaExecutor<R>,
    strategies: StrategyTable,
    configs: BTreeMap<ChainId, ChainConfig>,
    home: ChainId,
    agent: Address,
    policy: FailurePolicy,
}

#[bon::bon]
impl<R: StepRunner> RebalanceOrchestrator<R> {
    #[builder]
    pub fn new(
        executor: SagaExecutor<R>,
        #[builder(default = StrategyTable::standard())] strategies: StrategyTable,
        configs: BTreeMap<ChainId, ChainConfig>,
        home: ChainId,
        agent: Address,
        #[builder(default)] policy: FailurePolicy,
    ) -> Self {
        Self {
            executor,
            strategies,
            configs,
            home,
            agent,
            policy,
        }
    }

    pub const fn executor(&self) -> &SagaExecutor<R> {
        &self.executor
    }

    /// Executes `operations` in order. Failures are recorded in the report
    /// rather than returned.
    pub async fn execute(&self, operations: &[TransferOperation]) -> RebalanceReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("rebalance", %run_id, home = %self.home);

        async move {
            let mut reports = Vec::with_capacity(operations.len());
            let mut halted = false;

            for &operation in operations {
                if halted {
                    reports.push(OperationReport {
                        operation,
                        outcome: OperationOutcome::Skipped,
                    });
                    continue;
                }

                let outcome = match self.execute_one(operation).await {
                    Ok(context) => OperationOutcome::Completed(Box::new(context)),
                    Err(error) => {
                        error!(%operation, ?error, "Transfer failed");

                        if self.policy == FailurePolicy::Halt {
                            warn!("Halting rebalance, remaining transfers are skipped");
                            halted = true;
                        }

                        OperationOutcome::Failed(error)
                    }
                };

                reports.push(OperationReport { operation, outcome });
            }

            let report = RebalanceReport {
                run_id,
                operations: reports,
            };
            info!(
                completed = report.completed(),
                failed = report.failed(),
                skipped = report.skipped(),
                "Rebalance pass finished"
            );

            report
        }
        .instrument(span)
        .await
    }

    async fn execute_one(
        &self,
        operation: TransferOperation,
    ) -> Result<RunContext, OrchestratorError> {
        if operation.from == operation.to {
            return Err(OrchestratorError::SameChain(operation));
        }

        let flow = classify(operation.from, operation.to, self.home);
        let strategy = self
            .strategies
            .get(flow)
            .ok_or(OrchestratorError::UnknownFlow(flow))?;
        let context = RunContext::resolve(operation, flow, &self.configs, self.agent)?;

        info!(%operation, %flow, strategy = strategy.name, "Executing transfer");

        Ok(self
            .executor
            .run(strategy, context, None)
            .await
            .map_err(Box::new)?)
    }

    /// Reruns a failed saga from `restart_from`, keeping every record the
    /// failed run made.
    pub async fn resume(
        &self,
        failure: SagaFailure,
        restart_from: &str,
    ) -> Result<RunContext, OrchestratorError> {
        let context = *failure.context;
        let flow = context.flow;
        let strategy = self
            .strategies
            .get(flow)
            .ok_or(OrchestratorError::UnknownFlow(flow))?;

        info!(operation = %context.operation, restart_from, "Resuming transfer");

        Ok(self
            .executor
            .run(strategy, context, Some(restart_from))
            .await
            .inspect_err(|failure| error!(?failure, "Resumed transfer failed"))
            .map_err(Box::new)?)
    }
}
