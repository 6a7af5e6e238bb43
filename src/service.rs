// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

//! Drives proposal builders across heights.
//!
//! The [`OptimisticProposer`] reacts to the consensus events of a node. A commit starts a builder
//! for the next height, and the proposal request for that height takes the builder's proposal
//! and stops it. Accepting someone else's proposal also stops it. Only one builder is alive at
//! any time and a builder is always joined before the next one is created.

use crate::context::{CancelHandle, Context};
use crate::error::BuildError;
use crate::execution::{BuildContext, BuildProposal, ProposalHost};
use crate::metrics::{seconds, Histogram, Metrics, NoMetrics};
use crate::proposal::{PrepareProposalRequest, Proposal};
use crate::proposal_builder::{
    ProposalBuilder, ProposalBuilderConfig, DEFAULT_BLOCK_OVERHEAD_BYTES, DEFAULT_REBUILD_INTERVAL,
};
use crate::selector::DEFAULT_RECHECK_WAIT;
use async_lock::Mutex as AsyncMutex;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// No builder runs for the first block, nothing was committed that could have started one.
const FIRST_HEIGHT: u64 = 1;

#[derive(clap::Args, Clone, Debug)]
pub struct Options {
    /// Milliseconds between the end of one build and the start of the next
    #[clap(
        long,
        env = "PROPOSAL_BUILDER_REBUILD_INTERVAL_MS",
        default_value_t = DEFAULT_REBUILD_INTERVAL.as_millis() as u64
    )]
    pub rebuild_interval_ms: u64,

    /// Estimated bytes of a block that are not transactions
    #[clap(
        long,
        env = "PROPOSAL_BUILDER_BLOCK_OVERHEAD_BYTES",
        default_value_t = DEFAULT_BLOCK_OVERHEAD_BYTES
    )]
    pub block_overhead_bytes: u64,

    /// Milliseconds a build waits for the recheck of the parent height
    #[clap(
        long,
        env = "PROPOSAL_BUILDER_RECHECK_WAIT_MS",
        default_value_t = DEFAULT_RECHECK_WAIT.as_millis() as u64
    )]
    pub recheck_wait_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            rebuild_interval_ms: DEFAULT_REBUILD_INTERVAL.as_millis() as u64,
            block_overhead_bytes: DEFAULT_BLOCK_OVERHEAD_BYTES,
            recheck_wait_ms: DEFAULT_RECHECK_WAIT.as_millis() as u64,
        }
    }
}

impl Options {
    pub fn config(&self) -> ProposalBuilderConfig {
        ProposalBuilderConfig {
            rebuild_interval: Duration::from_millis(self.rebuild_interval_ms),
            block_overhead_bytes: self.block_overhead_bytes,
        }
        .normalized()
    }

    pub fn recheck_wait(&self) -> Duration {
        Duration::from_millis(self.recheck_wait_ms)
    }
}

/// The single authority over which height proposals are built for.
#[derive(Debug)]
pub struct OptimisticProposer<H, B> {
    host: Arc<H>,
    build: Arc<B>,
    config: ProposalBuilderConfig,

    current: AsyncMutex<Option<Arc<ProposalBuilder>>>,

    /// parent of every build context, cancelled on shutdown
    root: Context,
    shutdown: CancelHandle,

    last_commit: Mutex<Option<Instant>>,
    metrics: Arc<dyn Metrics>,
    commit_to_propose_duration: Box<dyn Histogram>,
}

impl<H, B> OptimisticProposer<H, B>
where
    H: ProposalHost,
    B: BuildProposal<H::State>,
{
    pub fn new(host: Arc<H>, build: Arc<B>, config: ProposalBuilderConfig) -> Self {
        let (root, shutdown) = Context::background().with_cancel();
        let metrics: Arc<dyn Metrics> = Arc::new(NoMetrics);
        Self {
            host,
            build,
            config: config.normalized(),
            current: AsyncMutex::new(None),
            root,
            shutdown,
            last_commit: Mutex::new(None),
            commit_to_propose_duration: Self::commit_to_propose(metrics.as_ref()),
            metrics,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.commit_to_propose_duration = Self::commit_to_propose(metrics.as_ref());
        self.metrics = metrics;
        self
    }

    fn commit_to_propose(metrics: &dyn Metrics) -> Box<dyn Histogram> {
        metrics.create_histogram(
            String::from("op_commit_to_propose_duration"),
            Some(String::from("seconds")),
        )
    }

    /// The builder currently owned by the proposer, stopped or not
    pub async fn current_builder(&self) -> Option<Arc<ProposalBuilder>> {
        self.current.lock().await.clone()
    }

    /// `height` was committed: retire the builder for it and start building for `height + 1`.
    pub async fn on_commit(&self, height: u64) {
        *self.last_commit.lock() = Some(Instant::now());

        let mut current = self.current.lock().await;
        if let Some(builder) = current.take() {
            // nobody asked us to propose and we never processed a proposal at this height
            if builder.try_stop() && height != FIRST_HEIGHT {
                warn!(height, "proposal builder still running during commit, stopped now");
            }
            builder.join().await;
        }

        let next_height = height + 1;
        info!(height = next_height, "creating proposal builder");
        let builder = Arc::new(
            ProposalBuilder::new(next_height, self.config).with_metrics(self.metrics.as_ref()),
        );
        builder.start_background_building(
            &self.root,
            Arc::clone(&self.host),
            Arc::clone(&self.build),
        );
        *current = Some(builder);
    }

    /// Answer a proposal request with the optimistically built proposal, building one on the
    /// spot when no builder runs for the height.
    ///
    /// # Panics
    ///
    /// If the running builder belongs to a different height than `req.height`.
    pub async fn prepare_proposal(
        &self,
        req: PrepareProposalRequest,
    ) -> Result<Arc<Proposal>, BuildError> {
        let height = req.height;
        if height > FIRST_HEIGHT {
            if let Some(last_commit) = *self.last_commit.lock() {
                self.commit_to_propose_duration
                    .add_point(seconds(last_commit.elapsed()));
            }
        }

        let builder = self.current.lock().await.clone();
        let builder = match builder {
            Some(builder) if height != FIRST_HEIGHT && !builder.is_stopped() => builder,
            _ => {
                warn!(
                    height,
                    "no proposal builder running at height, falling back to synchronous proposal"
                );
                return self.build_now(req).await.map(Arc::new);
            }
        };

        if builder.height() != height {
            panic!(
                "mismatch between proposal builder height {} and prepare proposal request height {height}",
                builder.height()
            );
        }

        let proposal = builder.prepare_proposal_handler(&req).await;

        info!(height, "returned optimistic proposal, stopping proposal builder");
        builder.try_stop();
        Ok(proposal)
    }

    /// A proposal for `height` was processed. Accepting it means we will most likely not
    /// propose at this height, so the builder is stopped.
    pub async fn process_proposal(&self, height: u64, accepted: bool) {
        if height == FIRST_HEIGHT || !accepted {
            return;
        }
        if let Some(builder) = self.current.lock().await.as_ref() {
            if builder.height() == height && builder.try_stop() {
                info!(height, "accepted proposal, stopped proposal builder");
            }
        }
    }

    /// Cancel every build and wait for the running builder to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let builder = self.current.lock().await.take();
        if let Some(builder) = builder {
            builder.try_stop();
            builder.join().await;
        }
    }

    async fn build_now(&self, req: PrepareProposalRequest) -> Result<Proposal, BuildError> {
        let ctx = BuildContext::new(&self.root, req.height, self.host.as_ref());
        self.build.build(&ctx, req).await
    }
}
