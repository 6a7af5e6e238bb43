// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

//! Height scoped access to a concurrently populated value.
//!
//! At every new block height a fresh value `V` is created, workers populate it through
//! [`HeightGate::with_value`] (e.g. while rechecking the mempool against the new state) and the
//! driver of the height declares it complete with [`HeightGate::end_current_height`]. Readers ask
//! for the value at a height with [`HeightGate::get`] and wait until that height is both reached
//! and settled, or until their context is done, whichever comes first. A reader whose context
//! expires at the right height still gets the partially populated value, which lets block
//! builders trade completeness for latency.
//!
//! The gate only guards its own bookkeeping. `V` is shared between all workers of an epoch and
//! has to synchronize its own internals.

use crate::context::Context;
use crate::metrics::{seconds, HeightGateMetrics, Metrics};
use crate::signal::Signal;
use async_lock::RwLock;
use derivative::Derivative;
use futures::future::{self, Either};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

const GENESIS_HEIGHT: u64 = 0;

type Factory<V> = Box<dyn Fn() -> V + Send + Sync>;

#[derive(Derivative)]
#[derivative(Debug(bound = "V: Debug"))]
struct Epoch<V> {
    height: u64,
    value: Arc<V>,
    /// fired when `height` is no longer the current height
    height_changed: Signal,
    /// fired when no more operations will happen on `value`
    settled: Signal,
}

#[derive(Derivative)]
#[derivative(Debug(bound = "V: Debug"))]
pub struct HeightGate<V> {
    epoch: RwLock<Epoch<V>>,
    #[derivative(Debug = "ignore")]
    factory: Factory<V>,
    /// require every epoch to be settled before the next one starts
    strict: bool,
    metrics: HeightGateMetrics,
}

impl<V: Send + Sync + 'static> HeightGate<V> {
    /// Create a gate at `start_height` holding a fresh value from `factory`.
    pub fn new<F>(start_height: u64, factory: F) -> Self
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        Self::build(start_height, Box::new(factory), false)
    }

    /// Create a gate whose starting epoch is already settled and which refuses to start a new
    /// height before the current one was ended.
    pub fn new_settled<F>(start_height: u64, factory: F) -> Self
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        Self::build(start_height, Box::new(factory), true)
    }

    fn build(start_height: u64, factory: Factory<V>, strict: bool) -> Self {
        let settled = Signal::new();
        if strict {
            settled.fire();
        }
        let value = Arc::new(factory());
        Self {
            epoch: RwLock::new(Epoch {
                height: start_height,
                value,
                height_changed: Signal::new(),
                settled,
            }),
            factory,
            strict,
            metrics: HeightGateMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: &dyn Metrics) -> Self {
        self.metrics = HeightGateMetrics::new(metrics);
        self
    }

    pub async fn current_height(&self) -> u64 {
        self.epoch.read().await.height
    }

    /// Start the epoch for `height`, replacing the value with a fresh one from the factory and
    /// waking everyone waiting for the height to change.
    ///
    /// Only the single driver of the height may call this.
    ///
    /// # Panics
    ///
    /// If `height` is lower than the current height, or, for a gate created with
    /// [`HeightGate::new_settled`], if the current height was not ended yet.
    pub async fn start_new_height(&self, height: u64) {
        let mut epoch = self.epoch.write().await;

        if height < epoch.height {
            panic!(
                "HeightGate cannot move backwards from height {} to height {height}",
                epoch.height
            );
        }
        if self.strict && !epoch.settled.is_fired() {
            panic!(
                "height {} not ended before starting new height {height}",
                epoch.height
            );
        }

        epoch.height = height;
        epoch.value = Arc::new((self.factory)());
        epoch.settled = Signal::new();

        let height_changed = std::mem::replace(&mut epoch.height_changed, Signal::new());
        height_changed.fire();

        debug!(height, "started new height");
    }

    /// Mark the value at the current height as complete. No more operations are expected on it,
    /// waiting readers are released.
    ///
    /// If a height is never ended, readers only get its value once their context is done.
    ///
    /// # Panics
    ///
    /// If the current height was already ended.
    pub async fn end_current_height(&self) {
        let epoch = self.epoch.write().await;
        if !epoch.settled.fire() {
            panic!("height {} already ended", epoch.height);
        }
        trace!(height = epoch.height, "ended height");
    }

    /// Run `f` against the value of the current height.
    ///
    /// Calls are not serialized against each other, only against height transitions.
    pub async fn with_value<F>(&self, f: F)
    where
        F: FnOnce(&V),
    {
        let epoch = self.epoch.read().await;
        f(epoch.value.as_ref());
    }

    /// Get the value at `height`.
    ///
    /// While the gate is behind `height` this waits for the height to advance, giving up with
    /// `None` once `ctx` is done. At `height` it waits for the height to be ended, and once `ctx`
    /// is done it returns the value as populated so far. The genesis value is returned
    /// immediately.
    ///
    /// # Panics
    ///
    /// If the gate has already moved past `height`.
    pub async fn get(&self, ctx: &Context, height: u64) -> Option<Arc<V>> {
        match self.try_get(ctx, height).await {
            Ok(value) => value,
            Err(current) => panic!(
                "HeightGate::get called for height {height}, but current height is \
                 {current}; cannot serve requests in the past"
            ),
        }
    }

    /// Like [`HeightGate::get`], but returns the current height as the error instead of
    /// panicking once the gate has moved past `height`, including while waiting for it.
    pub async fn try_get(&self, ctx: &Context, height: u64) -> Result<Option<Arc<V>>, u64> {
        let start = Instant::now();
        let value = self.get_inner(ctx, height).await;
        self.metrics.duration.add_point(seconds(start.elapsed()));
        value
    }

    async fn get_inner(&self, ctx: &Context, height: u64) -> Result<Option<Arc<V>>, u64> {
        loop {
            let (current, value, height_changed, settled) = {
                let epoch = self.epoch.read().await;
                (
                    epoch.height,
                    epoch.value.clone(),
                    epoch.height_changed.clone(),
                    epoch.settled.clone(),
                )
            };

            if current > height {
                return Err(current);
            }

            if current == height {
                // no completion signal ever arrives for genesis
                if current == GENESIS_HEIGHT {
                    return Ok(Some(value));
                }

                let wait_start = Instant::now();
                let waited =
                    future::select(Box::pin(settled.fired()), Box::pin(ctx.done())).await;
                match waited {
                    Either::Left(_) => self.metrics.complete.add(1),
                    Either::Right(_) => {
                        trace!(height, "gave up waiting for height to end, returning partial value");
                        self.metrics.timeout.add(1);
                    }
                }
                self.metrics
                    .wait_duration
                    .add_point(seconds(wait_start.elapsed()));
                return Ok(Some(value));
            }

            // behind the requested height, the value we hold belongs to another height
            drop(value);
            self.metrics.height_behind.add(1);

            let waited =
                future::select(Box::pin(height_changed.fired()), Box::pin(ctx.done())).await;
            if let Either::Right(_) = waited {
                trace!(height, current, "gave up waiting for height to be reached");
                self.metrics.timeout.add(1);
                return Ok(None);
            }
        }
    }
}
