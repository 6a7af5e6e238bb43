// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

//! The boundary between proposal building and the host application.
//!
//! The host supplies, for every build, a branched state view that the build may freely modify
//! and the chain's current block limits. Transaction selection itself is supplied as a
//! [`BuildProposal`] implementation.

use crate::context::Context;
use crate::error::BuildError;
use crate::proposal::{PrepareProposalRequest, Proposal};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Block limits of the chain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// maximum size of a whole block, including header, evidence and commit
    pub max_block_bytes: u64,
    /// maximum gas of a block, `None` if the chain does not limit it
    pub max_block_gas: Option<u64>,
}

pub trait ProposalHost: Send + Sync + 'static {
    /// Isolated view of the chain state a single build runs against
    type State: Send + Sync + 'static;

    /// Branch the latest committed state. Writes to the branch never reach the chain.
    fn branch_state(&self) -> Self::State;

    fn consensus_params(&self, state: &Self::State) -> ConsensusParams;
}

/// The transaction selection and execution that fills a proposal.
///
/// Implementations must return promptly once `ctx.context` is done, since the proposal builder
/// cancels that context to abandon a build.
#[async_trait]
pub trait BuildProposal<S>: Send + Sync + 'static {
    async fn build(
        &self,
        ctx: &BuildContext<S>,
        req: PrepareProposalRequest,
    ) -> Result<Proposal, BuildError>;
}

/// Gas accounting boundary of a single build
#[derive(Debug)]
pub struct GasMeter {
    limit: Option<u64>,
    consumed: AtomicU64,
}

impl GasMeter {
    pub fn infinite() -> Self {
        Self {
            limit: None,
            consumed: AtomicU64::new(0),
        }
    }

    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            consumed: AtomicU64::new(0),
        }
    }

    /// Limited by `max_block_gas` when the chain sets one, infinite otherwise
    pub fn for_block(params: &ConsensusParams) -> Self {
        match params.max_block_gas {
            Some(limit) if limit > 0 => Self::with_limit(limit),
            _ => Self::infinite(),
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> Option<u64> {
        self.limit
            .map(|limit| limit.saturating_sub(self.consumed()))
    }

    /// Consume `amount` gas. Fails without consuming anything if that would exceed the limit.
    pub fn consume(&self, amount: u64) -> Result<(), BuildError> {
        let Some(limit) = self.limit else {
            // an infinite meter saturates instead of wrapping around
            let _ = self
                .consumed
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |consumed| {
                    Some(consumed.saturating_add(amount))
                });
            return Ok(());
        };

        self.consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |consumed| {
                consumed
                    .checked_add(amount)
                    .filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|consumed| BuildError::OutOfGas {
                limit,
                consumed,
                wanted: amount,
            })
    }

    pub fn is_past_limit(&self) -> bool {
        self.remaining() == Some(0)
    }
}

/// Everything a single build runs with
#[derive(Debug)]
pub struct BuildContext<S> {
    /// done when the build should be abandoned
    pub context: Context,
    pub height: u64,
    pub state: S,
    pub consensus_params: ConsensusParams,
    pub gas_meter: GasMeter,
}

impl<S> BuildContext<S> {
    /// Branch the host's state for a build of a proposal at `height`
    pub fn new<H>(ctx: &Context, height: u64, host: &H) -> Self
    where
        H: ProposalHost<State = S> + ?Sized,
    {
        let state = host.branch_state();
        let consensus_params = host.consensus_params(&state);
        Self {
            context: ctx.clone(),
            height,
            state,
            gas_meter: GasMeter::for_block(&consensus_params),
            consensus_params,
        }
    }
}
