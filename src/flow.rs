//! Saga shape of a transfer relative to the home chain.

use std::fmt;

use crate::chain::ChainId;

/// Which of the three saga shapes a transfer takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Vault on the home chain to a remote lending market.
    HomeToRemote,
    /// Remote lending market back into the home vault.
    RemoteToHome,
    /// Between two remote lending markets.
    RemoteToRemote,
}

impl Flow {
    pub const ALL: [Self; 3] = [Self::HomeToRemote, Self::RemoteToHome, Self::RemoteToRemote];

    /// Name of the flow in the ledger's session bookkeeping.
    pub const fn ledger_name(self) -> &'static str {
        match self {
            Self::HomeToRemote => "RebalancerToAave",
            Self::RemoteToHome => "AaveToRebalancer",
            Self::RemoteToRemote => "AaveToAave",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ledger_name())
    }
}

/// Classifies a transfer. The source is checked first, so a transfer whose
/// ends are both the home chain is `HomeToRemote`.
pub fn classify(from: ChainId, to: ChainId, home: ChainId) -> Flow {
    if from == home {
        Flow::HomeToRemote
    } else if to == home {
        Flow::RemoteToHome
    } else {
        Flow::RemoteToRemote
    }
}
