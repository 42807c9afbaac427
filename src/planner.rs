//! Turns a current and a target allocation into pairwise transfers.
//!
//! A single greedy netting pass: every chain that must grow (destination)
//! is filled from the chains that must shrink (sources). Both sides are
//! visited in ascending chain id, so the same input always yields the same
//! operations in the same order. This is not a minimum-transfer solver;
//! bridge cost scales with amount rather than with operation count.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use tracing::debug;

use crate::chain::ChainId;
use crate::inventory::Allocation;

/// One transfer of `amount` base units from one chain to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOperation {
    pub from: ChainId,
    pub to: ChainId,
    pub amount: u128,
}

impl fmt::Display for TransferOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.from, self.to, self.amount)
    }
}

pub fn plan(current: &Allocation, target: &Allocation) -> Vec<TransferOperation> {
    let chains: BTreeSet<ChainId> = current.keys().chain(target.keys()).copied().collect();

    let mut sources = VecDeque::new();
    let mut destinations = Vec::new();

    for chain in chains {
        let have = current.get(&chain).copied().unwrap_or(0);
        let want = target.get(&chain).copied().unwrap_or(0);

        if want > have {
            destinations.push((chain, want - have));
        } else if have > want {
            sources.push_back((chain, have - want));
        }
    }

    let mut operations = Vec::new();

    for (to, mut need) in destinations {
        while need > 0 {
            let Some((from, surplus)) = sources.front_mut() else {
                debug!(%to, need, "Need left unmatched, no surplus remaining");
                break;
            };

            let amount = need.min(*surplus);
            if amount > 0 {
                operations.push(TransferOperation {
                    from: *from,
                    to,
                    amount,
                });
            }

            need -= amount;
            *surplus -= amount;

            if *surplus == 0 {
                sources.pop_front();
            }
        }
    }

    operations
}
