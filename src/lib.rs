// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

// Optimistic proposal building
// It mainly provides two services to the consensus layer of a node:
// 1. A height gate: a per-height value that many workers populate concurrently and
//    that readers can wait on until the height is reached and the value is settled
// 2. A proposal builder: a background loop that keeps rebuilding the candidate block
//    for the next height so that a proposal is ready the moment the proposer asks

// one-shot broadcast signals
pub mod signal;

// cancellation and deadlines handed to waiters and builds
pub mod context;

pub mod error;

pub mod metrics;

// height scoped synchronization of a value
pub mod height_gate;

// proposal and transaction types
pub mod proposal;

// the boundary with the host application (state, limits, gas, build function)
pub mod execution;

// the continuous best-effort proposal builder
pub mod proposal_builder;

// the per-height store of rechecked transactions
pub mod tx_store;

// greedy transaction selection out of a height gated tx store
pub mod selector;

// lifecycle of proposal builders across heights, driven by the consensus events
pub mod service;

// fixtures and test suites
pub mod testing;

pub use context::{CancelHandle, Context, ContextError};
pub use error::BuildError;
pub use execution::{BuildContext, BuildProposal, ConsensusParams, GasMeter, ProposalHost};
pub use height_gate::HeightGate;
pub use proposal::{PrepareProposalRequest, Proposal, Transaction};
pub use proposal_builder::{ProposalBuilder, ProposalBuilderConfig};
pub use service::OptimisticProposer;

use async_std::channel::{Receiver, RecvError};

/// Either still waiting on a channel for a value, or holding the value that was received.
///
/// Once the first value arrives it is kept, so every later `get` resolves immediately.
#[derive(Debug)]
pub enum WaitAndKeep<T> {
    Keep(T),
    Wait(Receiver<T>),
}

impl<T: Clone> WaitAndKeep<T> {
    pub async fn get(&mut self) -> Result<T, RecvError> {
        match self {
            WaitAndKeep::Keep(t) => Ok(t.clone()),
            WaitAndKeep::Wait(fut) => {
                let got = fut.recv().await;
                if let Ok(got) = &got {
                    let mut replace = WaitAndKeep::Keep(got.clone());
                    core::mem::swap(self, &mut replace);
                }
                got
            }
        }
    }

    pub fn is_kept(&self) -> bool {
        matches!(self, WaitAndKeep::Keep(_))
    }
}
