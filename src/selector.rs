// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

//! Greedy transaction selection.
//!
//! [`RecheckedTxsBuilder`] is the stock [`BuildProposal`] implementation: it takes the
//! transactions that passed recheck against the parent height out of a [`HeightGate`] of
//! [`TxStore`]s and packs them into a proposal with a [`TxSelector`].
//!
//! The store for epoch `h` holds the transactions rechecked after `h` was committed, which are
//! the candidates for a block at `h + 1`.

use crate::error::BuildError;
use crate::execution::{BuildContext, BuildProposal, GasMeter};
use crate::height_gate::HeightGate;
use crate::proposal::{PrepareProposalRequest, Proposal, Transaction};
use crate::tx_store::TxStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// How long a build waits for the recheck of the parent height to finish by default
pub const DEFAULT_RECHECK_WAIT: Duration = Duration::from_millis(250);

/// Fills a proposal in order, skipping transactions that do not fit.
#[derive(Debug, Default)]
pub struct TxSelector {
    total_bytes: u64,
    selected: Vec<Transaction>,
}

impl TxSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `tx` to the proposal. It is included if it fits in what is left of `max_tx_bytes`
    /// and `gas_meter` accepts its gas limit.
    ///
    /// Returns `true` once the proposal is full and no further transaction can be selected.
    pub fn select(&mut self, max_tx_bytes: u64, gas_meter: &GasMeter, tx: Transaction) -> bool {
        let size = tx.encoded_len();

        if self.total_bytes.saturating_add(size) <= max_tx_bytes {
            match gas_meter.consume(tx.gas_limit) {
                Ok(()) => {
                    self.total_bytes += size;
                    self.selected.push(tx);
                }
                Err(err) => trace!(%err, "skipping tx over the block gas limit"),
            }
        }

        self.total_bytes >= max_tx_bytes || gas_meter.is_past_limit()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn selected_txs(&self) -> &[Transaction] {
        &self.selected
    }

    pub fn into_proposal(self) -> Proposal {
        Proposal::new(self.selected)
    }

    pub fn clear(&mut self) {
        self.total_bytes = 0;
        self.selected.clear();
    }
}

/// Builds proposals out of the transactions rechecked at the parent height.
#[derive(Debug)]
pub struct RecheckedTxsBuilder {
    store: Arc<HeightGate<TxStore>>,
    recheck_wait: Duration,
}

impl RecheckedTxsBuilder {
    pub fn new(store: Arc<HeightGate<TxStore>>, recheck_wait: Duration) -> Self {
        Self {
            store,
            recheck_wait,
        }
    }

    pub fn store(&self) -> &Arc<HeightGate<TxStore>> {
        &self.store
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> BuildProposal<S> for RecheckedTxsBuilder {
    async fn build(
        &self,
        ctx: &BuildContext<S>,
        req: PrepareProposalRequest,
    ) -> Result<Proposal, BuildError> {
        let parent = req.height.saturating_sub(1);

        // a build that fell behind the gate is abandoned, the gate only panics for callers that
        // ask for a passed height through `get`
        let (wait_ctx, _cancel) = ctx.context.with_timeout(self.recheck_wait);
        let rechecked = match self.store.try_get(&wait_ctx, parent).await {
            Ok(Some(rechecked)) => rechecked,
            Ok(None) => {
                debug!(parent, "recheck never reached the parent height, proposing no txs");
                if let Some(reason) = ctx.context.err() {
                    return Err(BuildError::Cancelled { reason });
                }
                return Ok(Proposal::default());
            }
            Err(current) => {
                return Err(BuildError::StaleHeight {
                    requested: parent,
                    current,
                })
            }
        };

        if let Some(reason) = ctx.context.err() {
            return Err(BuildError::Cancelled { reason });
        }

        let mut selector = TxSelector::new();
        for tx in rechecked.txs() {
            if selector.select(req.max_tx_bytes, &ctx.gas_meter, tx) {
                break;
            }
        }

        debug!(
            height = req.height,
            num_txs = selector.selected_txs().len(),
            tx_bytes = selector.total_bytes(),
            "selected txs"
        );
        Ok(selector.into_proposal())
    }
}
