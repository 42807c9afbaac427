//! Yield-optimal allocation under a utilization-elastic rate model.
//!
//! Moving funds into a lending market raises its supply, lowers its
//! utilization and therefore its rate. For a candidate vector `x` of
//! fractions of the managed funds, chain `c` ends up with
//!
//! ```text
//! new_supply[c]      = total_supply[c] + x[c] * total_funds - current_allocation[c]
//! new_utilization[c] = total_borrow[c] / new_supply[c] * 100   (0 if new_supply <= 0)
//! new_rate[c]        = max(0, rate[c] + elasticity[c] * (new_utilization[c] - utilization[c]))
//! ```
//!
//! and the blended yield `Σ x[c] * new_rate[c]` is maximized over the
//! simplex `Σ x = 1, 0 <= x <= 1` by projected gradient ascent with an
//! Armijo line search, seeded at the current fractions. When the solver
//! does not converge the current allocation is returned unchanged.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::chain::ChainId;
use crate::inventory::Allocation;

const MAX_ITERATIONS: usize = 2_000;
const STATIONARITY_TOLERANCE: f64 = 1e-7;
/// Looser bound accepted when the line search can no longer improve.
const STALL_TOLERANCE: f64 = 1e-4;
const GRADIENT_STEP: f64 = 1e-7;
const ARMIJO_C1: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 60;

/// Market state of one chain, fixed for one optimization pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketSnapshot {
    pub chain_id: ChainId,
    pub current_allocation: u128,
    /// Supply rate in percent.
    pub current_interest_rate: f64,
    /// Rate change per utilization percentage point.
    pub supply_elasticity: f64,
    pub total_supply: u128,
    pub total_borrow: u128,
}

impl MarketSnapshot {
    /// Borrowed share of supply in percent; 0 for an empty market.
    pub fn utilization(&self) -> f64 {
        utilization(self.total_borrow as f64, self.total_supply as f64)
    }

    fn projected_rate(&self, fraction: f64, total_funds: f64) -> f64 {
        let new_supply =
            self.total_supply as f64 + fraction * total_funds - self.current_allocation as f64;
        let new_utilization = utilization(self.total_borrow as f64, new_supply);

        (self.current_interest_rate
            + self.supply_elasticity * (new_utilization - self.utilization()))
        .max(0.0)
    }
}

fn utilization(borrow: f64, supply: f64) -> f64 {
    if supply <= 0.0 {
        0.0
    } else {
        borrow / supply * 100.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Optimization {
    pub target_allocations: Allocation,
    /// Blended rate of the current allocation, in percent.
    pub current_avg_rate: f64,
    /// Blended rate of the target allocation after rate adjustment.
    pub projected_avg_rate: f64,
    /// Projected rate minus current rate, per chain.
    pub projected_rate_deltas: BTreeMap<ChainId, f64>,
    /// False when the solver gave up and the current allocation was kept.
    pub converged: bool,
}

struct Problem<'a> {
    chains: &'a [MarketSnapshot],
    total_funds: f64,
}

impl Problem<'_> {
    fn term(&self, index: usize, fraction: f64) -> f64 {
        fraction * self.chains[index].projected_rate(fraction, self.total_funds)
    }

    fn objective(&self, x: &[f64]) -> f64 {
        x.iter()
            .enumerate()
            .map(|(index, &fraction)| self.term(index, fraction))
            .sum()
    }

    /// Each term only depends on its own fraction, so the gradient is a
    /// central difference per coordinate.
    fn gradient(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .enumerate()
            .map(|(index, &fraction)| {
                let up = self.term(index, fraction + GRADIENT_STEP);
                let down = self.term(index, fraction - GRADIENT_STEP);
                (up - down) / (2.0 * GRADIENT_STEP)
            })
            .collect()
    }
}

/// Euclidean projection onto `{x : Σx = 1, x >= 0}`.
fn project_onto_simplex(v: &[f64]) -> Vec<f64> {
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));

    let mut cumulative = 0.0;
    let mut threshold = 0.0;
    for (index, &value) in sorted.iter().enumerate() {
        cumulative += value;
        let candidate = (cumulative - 1.0) / (index + 1) as f64;
        if value - candidate > 0.0 {
            threshold = candidate;
        }
    }

    v.iter().map(|value| (value - threshold).max(0.0)).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Distance between `x` and the projected unit gradient step; zero exactly
/// at a stationary point of the constrained problem.
fn stationarity(x: &[f64], gradient: &[f64]) -> f64 {
    let stepped: Vec<f64> = x.iter().zip(gradient).map(|(x, g)| x + g).collect();

    project_onto_simplex(&stepped)
        .iter()
        .zip(x)
        .map(|(projected, x)| (projected - x).abs())
        .fold(0.0, f64::max)
}

fn ascend(problem: &Problem<'_>, start: Vec<f64>) -> Option<Vec<f64>> {
    let mut x = project_onto_simplex(&start);
    let mut value = problem.objective(&x);
    let mut step = 1.0;

    for iteration in 0..MAX_ITERATIONS {
        if !value.is_finite() {
            return None;
        }

        let gradient = problem.gradient(&x);
        if gradient.iter().any(|g| !g.is_finite()) {
            return None;
        }

        let residual = stationarity(&x, &gradient);
        if residual <= STATIONARITY_TOLERANCE {
            debug!(iteration, residual, "Optimizer converged");
            return Some(x);
        }

        let mut accepted = None;
        let mut trial_step = step;
        for _ in 0..MAX_BACKTRACKS {
            let stepped: Vec<f64> = x
                .iter()
                .zip(&gradient)
                .map(|(x, g)| x + trial_step * g)
                .collect();
            let candidate = project_onto_simplex(&stepped);
            let movement: Vec<f64> = candidate.iter().zip(&x).map(|(c, x)| c - x).collect();
            let candidate_value = problem.objective(&candidate);

            if candidate_value >= value + ARMIJO_C1 * dot(&gradient, &movement) {
                accepted = Some((candidate, candidate_value));
                break;
            }

            trial_step /= 2.0;
        }

        let Some((candidate, candidate_value)) = accepted else {
            debug!(iteration, residual, "Line search stalled");
            return (residual <= STALL_TOLERANCE).then_some(x);
        };

        x = candidate;
        value = candidate_value;
        step = (trial_step * 2.0).min(1.0);
    }

    None
}

fn round_to_allocation(
    chains: &[MarketSnapshot],
    fractions: &[f64],
    total_funds: u128,
) -> Allocation {
    chains
        .iter()
        .zip(fractions)
        .map(|(chain, fraction)| {
            let amount = (fraction * total_funds as f64).round().max(0.0) as u128;
            (chain.chain_id, amount)
        })
        .collect()
}

/// Computes the target allocation of `total_funds` across `chains`.
pub fn optimize(total_funds: u128, chains: &[MarketSnapshot]) -> Optimization {
    let current: Allocation = chains
        .iter()
        .map(|chain| (chain.chain_id, chain.current_allocation))
        .collect();

    let problem = Problem {
        chains,
        total_funds: total_funds as f64,
    };

    let current_fractions: Vec<f64> = chains
        .iter()
        .map(|chain| {
            if total_funds == 0 {
                0.0
            } else {
                chain.current_allocation as f64 / total_funds as f64
            }
        })
        .collect();
    let current_avg_rate = chains
        .iter()
        .zip(&current_fractions)
        .map(|(chain, fraction)| fraction * chain.current_interest_rate)
        .sum();

    let market_data_finite = chains.iter().all(|chain| {
        chain.current_interest_rate.is_finite() && chain.supply_elasticity.is_finite()
    });

    let (fractions, target_allocations, converged) = match chains {
        [] => (Vec::new(), current, true),
        [only] => (
            vec![1.0],
            BTreeMap::from([(only.chain_id, total_funds)]),
            true,
        ),
        _ if total_funds == 0 => (current_fractions.clone(), current, true),
        _ if !market_data_finite => {
            warn!(
                chains = chains.len(),
                "Non-finite rate or elasticity, keeping current allocation"
            );
            (current_fractions.clone(), current, false)
        }
        _ => match ascend(&problem, current_fractions.clone()) {
            Some(fractions) => {
                let target = round_to_allocation(chains, &fractions, total_funds);
                (fractions, target, true)
            }
            None => {
                warn!(
                    chains = chains.len(),
                    total_funds, "Optimizer did not converge, keeping current allocation"
                );
                (current_fractions.clone(), current, false)
            }
        },
    };

    let projected_rate_deltas = chains
        .iter()
        .zip(&fractions)
        .map(|(chain, &fraction)| {
            let projected = chain.projected_rate(fraction, problem.total_funds);
            (chain.chain_id, projected - chain.current_interest_rate)
        })
        .collect();
    let projected_avg_rate = problem.objective(&fractions);

    info!(
        current_avg_rate,
        projected_avg_rate, converged, "Computed target allocation"
    );

    Optimization {
        target_allocations,
        current_avg_rate,
        projected_avg_rate,
        projected_rate_deltas,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(chain: u64, allocation: u128, rate: f64, elasticity: f64) -> MarketSnapshot {
        MarketSnapshot {
            chain_id: ChainId(chain),
            current_allocation: allocation,
            current_interest_rate: rate,
            supply_elasticity: elasticity,
            total_supply: 10_000_000,
            total_borrow: 6_000_000,
        }
    }

    fn total(allocation: &Allocation) -> u128 {
        allocation.values().sum()
    }

    #[test]
    fn no_chains_returns_input_unchanged() {
        let result = optimize(1_000, &[]);

        assert!(result.target_allocations.is_empty());
        assert!(result.converged);
        assert!(result.projected_rate_deltas.is_empty());
    }

    #[test]
    fn single_chain_receives_all_funds() {
        let result = optimize(1_000_000, &[snapshot(8453, 400_000, 5.0, 0.1)]);

        assert_eq!(
            result.target_allocations,
            BTreeMap::from([(ChainId(8453), 1_000_000)])
        );
    }

    #[test]
    fn identical_markets_keep_an_even_split() {
        let chains = [
            snapshot(1, 500_000, 4.0, 0.05),
            snapshot(2, 500_000, 4.0, 0.05),
        ];

        let result = optimize(1_000_000, &chains);

        assert!(result.converged);
        for amount in result.target_allocations.values() {
            assert!(amount.abs_diff(500_000) <= 1_000, "amount was {amount}");
        }
    }

    #[test]
    fn inelastic_markets_move_everything_to_the_best_rate() {
        let chains = [
            snapshot(1, 600_000, 3.0, 0.0),
            snapshot(2, 400_000, 5.0, 0.0),
        ];

        let result = optimize(1_000_000, &chains);

        assert!(result.converged);
        assert_eq!(result.target_allocations[&ChainId(1)], 0);
        assert_eq!(result.target_allocations[&ChainId(2)], 1_000_000);
        assert!((result.current_avg_rate - 3.8).abs() < 1e-9);
        assert!((result.projected_avg_rate - 5.0).abs() < 1e-6);
    }

    #[test]
    fn elastic_markets_split_to_balance_marginal_yield() {
        let chains = [
            MarketSnapshot {
                total_supply: 2_000_000,
                total_borrow: 1_600_000,
                ..snapshot(1, 500_000, 6.0, 0.2)
            },
            MarketSnapshot {
                total_supply: 2_000_000,
                total_borrow: 1_600_000,
                ..snapshot(2, 500_000, 4.0, 0.2)
            },
        ];

        let result = optimize(1_000_000, &chains);

        assert!(result.converged);
        let higher = result.target_allocations[&ChainId(1)];
        let lower = result.target_allocations[&ChainId(2)];
        assert!(higher > 500_000, "higher-rate chain got {higher}");
        assert!(lower > 0, "elasticity should keep some funds on chain 2");
        assert!(result.projected_avg_rate >= result.current_avg_rate - 1e-9);
    }

    #[test]
    fn rounding_slack_is_bounded_by_chain_count() {
        let chains = [
            snapshot(1, 333_333, 4.1, 0.03),
            snapshot(2, 333_333, 4.0, 0.02),
            snapshot(3, 333_334, 3.9, 0.04),
        ];

        let result = optimize(1_000_000, &chains);

        assert!(total(&result.target_allocations).abs_diff(1_000_000) <= 3);
    }

    #[test]
    fn empty_market_has_zero_utilization() {
        let empty = MarketSnapshot {
            total_supply: 0,
            total_borrow: 0,
            ..snapshot(1, 0, 2.0, 0.1)
        };

        assert!(empty.utilization().abs() < f64::EPSILON);

        let result = optimize(
            100,
            &[
                empty,
                MarketSnapshot {
                    current_allocation: 100,
                    ..snapshot(2, 100, 3.0, 0.0)
                },
            ],
        );
        assert_eq!(total(&result.target_allocations), 100);
    }

    #[test]
    fn non_finite_market_data_keeps_current_allocation() {
        let chains = [
            snapshot(1, 700, f64::NAN, 0.1),
            snapshot(2, 300, 4.0, 0.1),
        ];

        let result = optimize(1_000, &chains);

        assert!(!result.converged);
        assert_eq!(
            result.target_allocations,
            BTreeMap::from([(ChainId(1), 700), (ChainId(2), 300)])
        );
    }

    #[test]
    fn infinite_elasticity_keeps_current_allocation() {
        let chains = [
            snapshot(1, 250, 3.0, f64::INFINITY),
            snapshot(2, 750, 6.0, 0.1),
        ];

        let result = optimize(1_000, &chains);

        assert!(!result.converged);
        assert_eq!(result.target_allocations[&ChainId(1)], 250);
        assert_eq!(result.target_allocations[&ChainId(2)], 750);
    }

    #[test]
    fn zero_funds_keep_current_allocation() {
        let chains = [snapshot(1, 0, 4.0, 0.1), snapshot(2, 0, 5.0, 0.1)];

        let result = optimize(0, &chains);

        assert!(result.converged);
        assert_eq!(total(&result.target_allocations), 0);
        assert!(result.current_avg_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn projection_lands_on_the_simplex() {
        let projected = project_onto_simplex(&[0.9, 0.8, -0.2]);

        assert!((projected.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(projected.iter().all(|&x| (0.0..=1.0).contains(&x)));
        assert!((projected[0] - 0.55).abs() < 1e-12);
        assert!((projected[1] - 0.45).abs() < 1e-12);
        assert!(projected[2].abs() < f64::EPSILON);
    }
}
