//! Runs a strategy's steps in order with bounded per-step retries.

use std::collections::HashSet;
use std::time::Duration;

use backon::{ConstantBuilder, RetryableWithContext};
use tracing::{Instrument, error, info, info_span, warn};

use super::context::{ContextField, RunContext};
use super::step::{Step, StepError, StepRunner};
use super::strategy::Strategy;

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("no step named {0:?} in this strategy")]
    UnknownRestartStep(String),
    #[error("step {step} requires {field}, which no earlier step recorded or produces")]
    MissingPrerequisite { step: Step, field: ContextField },
    #[error("step {step} failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: StepError,
    },
}

/// An aborted saga, with whatever the completed steps recorded.
#[derive(Debug, thiserror::Error)]
#[error("{strategy} saga failed: {error}")]
pub struct SagaFailure {
    pub strategy: &'static str,
    #[source]
    pub error: SagaError,
    pub context: Box<RunContext>,
}

impl SagaFailure {
    /// The step that failed, if the saga got as far as running one.
    pub const fn step(&self) -> Option<Step> {
        match &self.error {
            SagaError::Step { step, .. } | SagaError::MissingPrerequisite { step, .. } => {
                Some(*step)
            }
            SagaError::UnknownRestartStep(_) => None,
        }
    }
}

/// Checks that every step in `steps` can read what it requires, given what
/// `context` already holds and what earlier steps will produce.
fn check_prerequisites(steps: &[Step], context: &RunContext) -> Result<(), SagaError> {
    let mut available: HashSet<ContextField> = ContextField::ALL
        .into_iter()
        .filter(|field| context.has(*field))
        .collect();

    for &step in steps {
        if let Some(&field) = step
            .requires()
            .iter()
            .find(|field| !available.contains(field))
        {
            return Err(SagaError::MissingPrerequisite { step, field });
        }

        available.extend(step.produces());
    }

    Ok(())
}

pub struct SagaExecutor<R> {
    runner: R,
    attempts: usize,
    retry_delay: Duration,
}

impl<R: StepRunner> SagaExecutor<R> {
    /// `attempts` is the total number of tries per step, at least one.
    pub fn new(runner: R, attempts: usize, retry_delay: Duration) -> Self {
        Self {
            runner,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Runs `strategy` from the start, or from the step named
    /// `restart_from`. The first step that fails after its retries aborts
    /// the saga.
    pub async fn run(
        &self,
        strategy: &Strategy,
        context: RunContext,
        restart_from: Option<&str>,
    ) -> Result<RunContext, SagaFailure> {
        let span = info_span!(
            "saga",
            strategy = strategy.name,
            operation = %context.operation,
        );

        self.run_steps(strategy, context, restart_from)
            .instrument(span)
            .await
    }

    async fn run_steps(
        &self,
        strategy: &Strategy,
        mut context: RunContext,
        restart_from: Option<&str>,
    ) -> Result<RunContext, SagaFailure> {
        let fail = |error, context| SagaFailure {
            strategy: strategy.name,
            error,
            context: Box::new(context),
        };

        let start = match restart_from {
            None => 0,
            Some(name) => match strategy.position(name) {
                Some(index) => index,
                None => return Err(fail(SagaError::UnknownRestartStep(name.to_owned()), context)),
            },
        };

        let remaining = &strategy.steps[start..];

        if let Err(error) = check_prerequisites(remaining, &context) {
            return Err(fail(error, context));
        }

        if start > 0 {
            info!(restart_from = remaining.first().map(|step| step.name()), "Resuming saga");
        }

        for &step in remaining {
            let (returned, result) = self.run_step(step, context).await;
            context = returned;

            if let Err(source) = result {
                error!(%step, ?source, "Saga step failed, aborting");
                return Err(fail(SagaError::Step { step, source }, context));
            }
        }

        info!("Saga completed");
        Ok(context)
    }

    async fn run_step(
        &self,
        step: Step,
        context: RunContext,
    ) -> (RunContext, Result<(), StepError>) {
        info!(%step, "Running step");

        let backoff = ConstantBuilder::default()
            .with_delay(self.retry_delay)
            .with_max_times(self.attempts - 1);

        (|mut context: RunContext| async move {
            let result = self.runner.run(step, &mut context).await;
            (context, result)
        })
        .retry(backoff)
        .context(context)
        .when(StepError::is_retryable)
        .notify(|error, after| {
            warn!(%step, ?error, retry_in = ?after, "Step failed, retrying");
        })
        .await
    }
}
