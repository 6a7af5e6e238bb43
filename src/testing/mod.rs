// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

//! Fixtures shared by the test suites.

use crate::context::ContextError;
use crate::error::BuildError;
use crate::execution::{BuildContext, BuildProposal, ConsensusParams, ProposalHost};
use crate::metrics::{Counter, Gauge, Histogram, Metrics};
use crate::proposal::{PrepareProposalRequest, Proposal, Transaction};
use crate::signal::Signal;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[cfg(test)]
mod height_gate_test;
#[cfg(test)]
mod proposal_builder_test;

/// Install a `RUST_LOG` driven subscriber that writes through the test harness. Safe to call
/// from every test.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `n` distinct transactions of `len` bytes and 1 gas each
pub fn test_txs(n: usize, len: usize) -> Vec<Transaction> {
    (0..n)
        .map(|i| {
            let mut data = vec![0u8; len.max(8)];
            data[..8].copy_from_slice(&(i as u64).to_le_bytes());
            Transaction::new(data, 1)
        })
        .collect()
}

/// A host whose branched state is just the number of branches taken so far
#[derive(Debug)]
pub struct MockHost {
    params: Mutex<ConsensusParams>,
    branches: AtomicUsize,
}

impl MockHost {
    pub fn new(max_block_bytes: u64, max_block_gas: Option<u64>) -> Self {
        Self {
            params: Mutex::new(ConsensusParams {
                max_block_bytes,
                max_block_gas,
            }),
            branches: AtomicUsize::new(0),
        }
    }

    pub fn set_params(&self, params: ConsensusParams) {
        *self.params.lock() = params;
    }

    pub fn branches(&self) -> usize {
        self.branches.load(Ordering::SeqCst)
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new(1_000_000, None)
    }
}

impl ProposalHost for MockHost {
    type State = usize;

    fn branch_state(&self) -> usize {
        self.branches.fetch_add(1, Ordering::SeqCst)
    }

    fn consensus_params(&self, _: &usize) -> ConsensusParams {
        *self.params.lock()
    }
}

/// Returns proposals with a scripted number of txs, one script entry per build. Once the script
/// runs out every build repeats the last entry.
#[derive(Debug)]
pub struct ScriptedBuilder {
    script: Mutex<VecDeque<Result<usize, BuildError>>>,
    last: Mutex<Result<usize, BuildError>>,
    delay: Duration,
    requests: Mutex<Vec<PrepareProposalRequest>>,
    built: Signal,
}

impl ScriptedBuilder {
    pub fn new(script: impl IntoIterator<Item = Result<usize, BuildError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(Ok(0)),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            built: Signal::new(),
        }
    }

    /// Shorthand for a script of successful builds
    pub fn counts(counts: impl IntoIterator<Item = usize>) -> Self {
        Self::new(counts.into_iter().map(Ok))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every request seen so far, in order
    pub fn requests(&self) -> Vec<PrepareProposalRequest> {
        self.requests.lock().clone()
    }

    pub fn builds(&self) -> usize {
        self.requests.lock().len()
    }

    /// Wait until the script ran out
    pub async fn exhausted(&self) {
        self.built.fired().await
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> BuildProposal<S> for ScriptedBuilder {
    async fn build(
        &self,
        _ctx: &BuildContext<S>,
        req: PrepareProposalRequest,
    ) -> Result<Proposal, BuildError> {
        if !self.delay.is_zero() {
            async_std::task::sleep(self.delay).await;
        }

        let next = {
            let mut script = self.script.lock();
            let mut last = self.last.lock();
            if let Some(next) = script.pop_front() {
                *last = next;
            }
            if script.is_empty() {
                self.built.fire();
            }
            last.clone()
        };
        self.requests.lock().push(req);

        next.map(|n| Proposal::new(test_txs(n, 8)))
    }
}

/// Never finishes a build on its own, only returns once its context is done.
#[derive(Debug, Default)]
pub struct BlockingBuilder {
    started: Signal,
    /// why each abandoned build's context was done
    observed: Mutex<Vec<ContextError>>,
}

impl BlockingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a build is in progress
    pub async fn started(&self) {
        self.started.fired().await
    }

    pub fn observed(&self) -> Vec<ContextError> {
        self.observed.lock().clone()
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> BuildProposal<S> for BlockingBuilder {
    async fn build(
        &self,
        ctx: &BuildContext<S>,
        _req: PrepareProposalRequest,
    ) -> Result<Proposal, BuildError> {
        self.started.fire();
        ctx.context.done().await;

        let reason = ctx.context.err().unwrap_or(ContextError::Cancelled);
        self.observed.lock().push(reason);
        Err(BuildError::Cancelled { reason })
    }
}

/// Metrics that remember everything reported to them, by label
#[derive(Debug, Default, Clone)]
pub struct RecordingMetrics {
    counters: Arc<Mutex<HashMap<String, usize>>>,
    gauges: Arc<Mutex<HashMap<String, usize>>>,
    histograms: Arc<Mutex<HashMap<String, Vec<f64>>>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, label: &str) -> usize {
        self.counters.lock().get(label).copied().unwrap_or_default()
    }

    pub fn gauge(&self, label: &str) -> usize {
        self.gauges.lock().get(label).copied().unwrap_or_default()
    }

    pub fn points(&self, label: &str) -> Vec<f64> {
        self.histograms
            .lock()
            .get(label)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug)]
struct Recorded<T> {
    label: String,
    values: Arc<Mutex<HashMap<String, T>>>,
}

impl Counter for Recorded<usize> {
    fn add(&self, amount: usize) {
        *self.values.lock().entry(self.label.clone()).or_default() += amount;
    }
}

impl Gauge for Recorded<usize> {
    fn set(&self, amount: usize) {
        self.values.lock().insert(self.label.clone(), amount);
    }
}

impl Histogram for Recorded<Vec<f64>> {
    fn add_point(&self, point: f64) {
        self.values
            .lock()
            .entry(self.label.clone())
            .or_default()
            .push(point);
    }
}

impl Metrics for RecordingMetrics {
    fn create_counter(&self, label: String, _: Option<String>) -> Box<dyn Counter> {
        Box::new(Recorded {
            label,
            values: Arc::clone(&self.counters),
        })
    }

    fn create_gauge(&self, label: String, _: Option<String>) -> Box<dyn Gauge> {
        Box::new(Recorded {
            label,
            values: Arc::clone(&self.gauges),
        })
    }

    fn create_histogram(&self, label: String, _: Option<String>) -> Box<dyn Histogram> {
        Box::new(Recorded {
            label,
            values: Arc::clone(&self.histograms),
        })
    }
}

/// A value populated by many workers at once
#[derive(Debug, Default)]
pub struct TestValue {
    items: Mutex<Vec<String>>,
}

impl TestValue {
    pub fn push(&self, item: impl Into<String>) {
        self.items.lock().push(item.into());
    }

    pub fn items(&self) -> Vec<String> {
        self.items.lock().clone()
    }
}
