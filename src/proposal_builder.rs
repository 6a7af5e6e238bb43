// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

//! Continuous best-effort proposal building.
//!
//! A [`ProposalBuilder`] is bound to a single height. Once started it keeps rebuilding the
//! proposal for that height in a background task, one build at a time, and retains the best
//! result seen so far. The proposer asks for it through
//! [`ProposalBuilder::prepare_proposal_handler`], which only waits if no build has finished yet.

use crate::context::{CancelHandle, Context};
use crate::error::BuildError;
use crate::execution::{BuildContext, BuildProposal, ProposalHost};
use crate::metrics::{seconds, Metrics, ProposalBuilderMetrics};
use crate::proposal::{PrepareProposalRequest, Proposal};
use crate::signal::Signal;
use crate::WaitAndKeep;
use async_lock::Mutex as AsyncMutex;
use async_std::channel::{bounded, Sender};
use async_std::task::{self, JoinHandle};
use futures::future::{self, Either};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

pub const DEFAULT_REBUILD_INTERVAL: Duration = Duration::from_millis(100);

/// Bytes of a block taken up by the encoding, header, last commit and evidence.
///
/// The consensus engine subtracts these from the block size limit when it asks for a proposal,
/// the builder runs ahead of that request and can only estimate them. 2000 bytes covers a set of
/// five validators without evidence.
pub const DEFAULT_BLOCK_OVERHEAD_BYTES: u64 = 2000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalBuilderConfig {
    /// Time between the end of one build and the start of the next
    pub rebuild_interval: Duration,
    /// Estimated non transaction bytes of a block
    pub block_overhead_bytes: u64,
}

impl Default for ProposalBuilderConfig {
    fn default() -> Self {
        Self {
            rebuild_interval: DEFAULT_REBUILD_INTERVAL,
            block_overhead_bytes: DEFAULT_BLOCK_OVERHEAD_BYTES,
        }
    }
}

impl ProposalBuilderConfig {
    /// Replace unset values with their defaults
    pub fn normalized(mut self) -> Self {
        if self.rebuild_interval.is_zero() {
            self.rebuild_interval = DEFAULT_REBUILD_INTERVAL;
        }
        self
    }
}

#[derive(Debug)]
pub struct ProposalBuilder {
    /// the height this builder builds proposals for, fixed for its lifetime
    height: u64,
    config: ProposalBuilderConfig,

    /// the current best proposal for `height`
    latest_proposal: Mutex<Arc<Proposal>>,

    /// holds a value once at least one proposal was built, never more than one
    proposals_created: Sender<()>,
    first_proposal: AsyncMutex<WaitAndKeep<()>>,

    /// tells the background loop to stop
    done: Signal,
    is_done: AtomicBool,

    task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
    metrics: ProposalBuilderMetrics,
}

impl ProposalBuilder {
    pub fn new(height: u64, config: ProposalBuilderConfig) -> Self {
        let (proposals_created, receiver) = bounded(1);
        Self {
            height,
            config: config.normalized(),
            latest_proposal: Mutex::new(Arc::new(Proposal::default())),
            proposals_created,
            first_proposal: AsyncMutex::new(WaitAndKeep::Wait(receiver)),
            done: Signal::new(),
            is_done: AtomicBool::new(false),
            task: Mutex::new(None),
            span: info_span!("proposal_builder", height),
            metrics: ProposalBuilderMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: &dyn Metrics) -> Self {
        self.metrics = ProposalBuilderMetrics::new(metrics);
        self
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn config(&self) -> &ProposalBuilderConfig {
        &self.config
    }

    /// Kick off the background task that keeps building proposals at this builder's height.
    ///
    /// Builds run against a context derived from `parent`, which is cancelled when the builder
    /// is stopped.
    ///
    /// # Panics
    ///
    /// If the builder was already started.
    pub fn start_background_building<H, B>(
        self: &Arc<Self>,
        parent: &Context,
        host: Arc<H>,
        build: Arc<B>,
    ) where
        H: ProposalHost,
        B: BuildProposal<H::State>,
    {
        let mut handle = self.task.lock();
        if handle.is_some() {
            panic!("proposal builder for height {} started twice", self.height);
        }

        let (ctx, cancel) = parent.with_cancel();
        let builder = Arc::clone(self);
        let span = self.span.clone();
        *handle = Some(task::spawn(
            async move { builder.run(ctx, cancel, host, build).await }.instrument(span),
        ));
    }

    async fn run<H, B>(
        self: Arc<Self>,
        ctx: Context,
        cancel: CancelHandle,
        host: Arc<H>,
        build: Arc<B>,
    ) where
        H: ProposalHost,
        B: BuildProposal<H::State>,
    {
        let mut proposals_created = 0;

        loop {
            let start = Instant::now();
            let building = self.build(&ctx, host.as_ref(), build.as_ref());

            match future::select(Box::pin(building), Box::pin(self.done.fired())).await {
                Either::Left((result, _)) => {
                    proposals_created += 1;
                    self.metrics.proposals_per_height.set(proposals_created);
                    self.metrics
                        .creation_duration
                        .add_point(seconds(start.elapsed()));
                    self.set_latest_proposal(result, start.elapsed());
                }
                Either::Right((_, building)) => {
                    info!("received done signal, cancelling context for the proposal being built");
                    cancel.cancel();
                    // the build has been told to stop, let it unwind before exiting
                    if let Err(err) = building.await {
                        debug!(%err, "in-flight proposal abandoned");
                    }
                    return;
                }
            }

            let rebuild = task::sleep(self.config.rebuild_interval);
            if let Either::Right(_) =
                future::select(Box::pin(rebuild), Box::pin(self.done.fired())).await
            {
                info!("received done signal, stopping proposal builder");
                cancel.cancel();
                return;
            }
        }
    }

    /// Build one proposal against a freshly branched context.
    async fn build<H, B>(
        &self,
        ctx: &Context,
        host: &H,
        build: &B,
    ) -> Result<Proposal, BuildError>
    where
        H: ProposalHost,
        B: BuildProposal<H::State>,
    {
        let build_ctx = BuildContext::new(ctx, self.height, host);

        let req = PrepareProposalRequest {
            height: self.height,
            max_tx_bytes: build_ctx
                .consensus_params
                .max_block_bytes
                .saturating_sub(self.config.block_overhead_bytes),
        };

        debug!(max_tx_bytes = req.max_tx_bytes, "building a new proposal");
        build.build(&build_ctx, req).await
    }

    /// Replace the latest proposal if the new one holds a different number of transactions and
    /// signal that a proposal exists.
    fn set_latest_proposal(&self, result: Result<Proposal, BuildError>, elapsed: Duration) {
        let proposal = match result {
            Ok(proposal) => proposal,
            Err(err) => {
                error!(%err, "proposal builder failed to prepare proposal");
                self.metrics.failed_builds.add(1);
                return;
            }
        };

        {
            let mut latest = self.latest_proposal.lock();
            let new_txs = proposal.num_txs();
            let old_txs = latest.num_txs();

            if new_txs != old_txs {
                if new_txs < old_txs {
                    warn!(new_txs, old_txs, "replacing proposal with one holding fewer txs");
                    self.metrics.worse_proposals.add(1);
                }
                info!(num_txs = new_txs, ?elapsed, "found new best proposal");
                *latest = Arc::new(proposal);
            }
        }

        self.signal_proposal_created();
    }

    fn signal_proposal_created(&self) {
        // the channel only ever says "at least one proposal exists", a full channel already
        // says that
        let _ = self.proposals_created.try_send(());
    }

    /// The current best proposal, without waiting.
    pub fn latest_proposal(&self) -> Arc<Proposal> {
        Arc::clone(&self.latest_proposal.lock())
    }

    /// Wait until at least one proposal was built, then return the latest one.
    ///
    /// There is no timeout on the wait, see [`ProposalBuilder::prepare_proposal_until`].
    pub async fn prepare_proposal_handler(&self, _req: &PrepareProposalRequest) -> Arc<Proposal> {
        let start = Instant::now();
        self.wait_for_proposal_creation().await;
        self.metrics
            .prepare_wait_duration
            .add_point(seconds(start.elapsed()));
        self.latest_proposal()
    }

    /// Like [`ProposalBuilder::prepare_proposal_handler`], but gives up with `None` once `ctx`
    /// is done and no proposal was built yet.
    pub async fn prepare_proposal_until(&self, ctx: &Context) -> Option<Arc<Proposal>> {
        let start = Instant::now();
        let waited = future::select(
            Box::pin(self.wait_for_proposal_creation()),
            Box::pin(ctx.done()),
        )
        .await;
        self.metrics
            .prepare_wait_duration
            .add_point(seconds(start.elapsed()));

        match waited {
            Either::Left(_) => Some(self.latest_proposal()),
            Either::Right(_) => {
                warn!(height = self.height, "gave up waiting for the first proposal");
                None
            }
        }
    }

    async fn wait_for_proposal_creation(&self) {
        let mut first_proposal = self.first_proposal.lock().await;
        // the sender lives as long as `self`, so the channel cannot close under us
        if first_proposal.get().await.is_err() {
            error!(height = self.height, "proposal created channel closed");
        }
    }

    /// Signal the background task to stop. No new proposals are created after this and a build
    /// in progress is cancelled.
    ///
    /// # Panics
    ///
    /// If the builder was already stopped.
    pub fn stop(&self) {
        if !self.try_stop() {
            panic!("proposal builder for height {} stopped twice", self.height);
        }
    }

    /// Stop the builder unless it already was. Returns whether this call stopped it.
    pub fn try_stop(&self) -> bool {
        let stopped = self.done.fire();
        self.is_done.store(true, Ordering::Release);
        stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.is_done.load(Ordering::Acquire)
    }

    /// Wait for the background task to exit. Returns immediately if it was never started.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await;
        }
    }
}
