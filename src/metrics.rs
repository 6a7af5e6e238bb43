// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

//! Metrics interfaces.
//!
//! The crate never depends on a concrete metrics backend, hosts plug one in through [`Metrics`]
//! and [`NoMetrics`] is used when nothing is plugged in.

use std::fmt::Debug;
use std::time::Duration;

/// A monotonically increasing value
pub trait Counter: Send + Sync + Debug {
    fn add(&self, amount: usize);
}

/// A value that can go up and down
pub trait Gauge: Send + Sync + Debug {
    fn set(&self, amount: usize);
}

/// A distribution of observed values
pub trait Histogram: Send + Sync + Debug {
    fn add_point(&self, point: f64);
}

/// Factory for the individual metrics
pub trait Metrics: Send + Sync + Debug {
    fn create_counter(&self, label: String, unit_label: Option<String>) -> Box<dyn Counter>;
    fn create_gauge(&self, label: String, unit_label: Option<String>) -> Box<dyn Gauge>;
    fn create_histogram(&self, label: String, unit_label: Option<String>) -> Box<dyn Histogram>;
}

/// Metrics sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetrics;

impl NoMetrics {
    pub fn boxed() -> Box<dyn Metrics> {
        Box::new(NoMetrics)
    }
}

impl Metrics for NoMetrics {
    fn create_counter(&self, _: String, _: Option<String>) -> Box<dyn Counter> {
        Box::new(NoMetrics)
    }

    fn create_gauge(&self, _: String, _: Option<String>) -> Box<dyn Gauge> {
        Box::new(NoMetrics)
    }

    fn create_histogram(&self, _: String, _: Option<String>) -> Box<dyn Histogram> {
        Box::new(NoMetrics)
    }
}

impl Counter for NoMetrics {
    fn add(&self, _: usize) {}
}

impl Gauge for NoMetrics {
    fn set(&self, _: usize) {}
}

impl Histogram for NoMetrics {
    fn add_point(&self, _: f64) {}
}

pub(crate) fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// Metrics reported by a [`HeightGate`](crate::HeightGate)
#[derive(Debug)]
pub struct HeightGateMetrics {
    /// Number of times `get` returned a settled value
    pub complete: Box<dyn Counter>,
    /// Number of times `get` gave up waiting, with a partial value or with nothing
    pub timeout: Box<dyn Counter>,
    /// Number of times `get` was asked for a height the gate had not reached yet
    pub height_behind: Box<dyn Counter>,
    /// Time spent waiting for the value at the requested height to settle
    pub wait_duration: Box<dyn Histogram>,
    /// Total time spent in `get`
    pub duration: Box<dyn Histogram>,
}

impl HeightGateMetrics {
    #[must_use]
    pub fn new(metrics: &dyn Metrics) -> Self {
        let seconds = || Some(String::from("seconds"));
        Self {
            complete: metrics.create_counter(String::from("height_sync_complete"), None),
            timeout: metrics.create_counter(String::from("height_sync_timeout"), None),
            height_behind: metrics.create_counter(String::from("height_sync_height_behind"), None),
            wait_duration: metrics
                .create_histogram(String::from("height_sync_wait_duration"), seconds()),
            duration: metrics.create_histogram(String::from("height_sync_duration"), seconds()),
        }
    }
}

impl Default for HeightGateMetrics {
    fn default() -> Self {
        Self::new(&*NoMetrics::boxed())
    }
}

/// Metrics reported by a [`ProposalBuilder`](crate::ProposalBuilder)
#[derive(Debug)]
pub struct ProposalBuilderMetrics {
    /// Number of proposals built so far for the builder's height
    pub proposals_per_height: Box<dyn Gauge>,
    /// Time taken by a single build
    pub creation_duration: Box<dyn Histogram>,
    /// Number of times the retained proposal was replaced by one with fewer transactions
    pub worse_proposals: Box<dyn Counter>,
    /// Number of builds that returned an error
    pub failed_builds: Box<dyn Counter>,
    /// Time the proposer spent waiting for the first proposal
    pub prepare_wait_duration: Box<dyn Histogram>,
}

impl ProposalBuilderMetrics {
    #[must_use]
    pub fn new(metrics: &dyn Metrics) -> Self {
        let seconds = || Some(String::from("seconds"));
        Self {
            proposals_per_height: metrics
                .create_gauge(String::from("optimistic_proposal_proposals_per_height"), None),
            creation_duration: metrics.create_histogram(
                String::from("optimistic_proposal_creation_duration"),
                seconds(),
            ),
            worse_proposals: metrics
                .create_counter(String::from("optimistic_proposal_worse_proposals"), None),
            failed_builds: metrics
                .create_counter(String::from("optimistic_proposal_failed_builds"), None),
            prepare_wait_duration: metrics.create_histogram(
                String::from("optimistic_prepare_proposal_wait_duration"),
                seconds(),
            ),
        }
    }
}

impl Default for ProposalBuilderMetrics {
    fn default() -> Self {
        Self::new(&*NoMetrics::boxed())
    }
}
