// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

use super::{setup_test_logging, BlockingBuilder, MockHost, RecordingMetrics, ScriptedBuilder};
use crate::context::{Context, ContextError};
use crate::error::BuildError;
use crate::proposal::PrepareProposalRequest;
use crate::proposal_builder::{ProposalBuilder, ProposalBuilderConfig};
use async_std::future::timeout;
use async_std::task;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> ProposalBuilderConfig {
    ProposalBuilderConfig {
        rebuild_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn request(height: u64) -> PrepareProposalRequest {
    PrepareProposalRequest {
        height,
        max_tx_bytes: 1_000_000,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            task::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

fn start(
    builder: &Arc<ProposalBuilder>,
    script: ScriptedBuilder,
) -> (Arc<MockHost>, Arc<ScriptedBuilder>) {
    let host = Arc::new(MockHost::default());
    let build = Arc::new(script);
    builder.start_background_building(
        &Context::background(),
        Arc::clone(&host),
        Arc::clone(&build),
    );
    (host, build)
}

#[async_std::test]
async fn prepare_waits_for_the_first_build() {
    setup_test_logging();
    let builder = Arc::new(ProposalBuilder::new(7, fast_config()));
    // nothing built yet, the placeholder is empty
    assert!(builder.latest_proposal().is_empty());

    let (host, _build) = start(
        &builder,
        ScriptedBuilder::counts([3]).with_delay(Duration::from_millis(50)),
    );

    let proposal = timeout(
        Duration::from_secs(2),
        builder.prepare_proposal_handler(&request(7)),
    )
    .await
    .expect("first proposal never built");
    assert_eq!(proposal.num_txs(), 3);
    assert!(host.branches() >= 1);

    builder.stop();
    builder.join().await;
}

#[async_std::test]
async fn empty_first_build_releases_prepare() {
    let builder = Arc::new(ProposalBuilder::new(2, fast_config()));
    start(&builder, ScriptedBuilder::counts([0]));

    let proposal = timeout(
        Duration::from_secs(2),
        builder.prepare_proposal_handler(&request(2)),
    )
    .await
    .expect("an empty build must still count as a proposal");
    assert!(proposal.is_empty());

    builder.stop();
    builder.join().await;
}

#[async_std::test]
async fn proposal_with_more_txs_replaces_the_latest() {
    let builder = Arc::new(ProposalBuilder::new(3, fast_config()));
    let (_host, build) = start(&builder, ScriptedBuilder::counts([3, 5]));

    build.exhausted().await;
    eventually(|| builder.latest_proposal().num_txs() == 5).await;

    builder.stop();
    builder.join().await;
    assert_eq!(builder.latest_proposal().num_txs(), 5);
}

#[async_std::test]
async fn proposal_with_the_same_count_is_not_swapped_in() {
    let builder = Arc::new(ProposalBuilder::new(3, fast_config()));
    let (_host, build) = start(&builder, ScriptedBuilder::counts([5]));

    eventually(|| builder.latest_proposal().num_txs() == 5).await;
    let first = builder.latest_proposal();
    let builds = build.builds();
    eventually(|| build.builds() >= builds + 3).await;

    builder.stop();
    builder.join().await;
    assert!(Arc::ptr_eq(&first, &builder.latest_proposal()));
}

#[async_std::test]
async fn proposal_with_fewer_txs_still_replaces_the_latest() {
    let metrics = RecordingMetrics::new();
    let builder = Arc::new(ProposalBuilder::new(4, fast_config()).with_metrics(&metrics));
    let (_host, build) = start(&builder, ScriptedBuilder::counts([5, 2]));

    build.exhausted().await;
    eventually(|| builder.latest_proposal().num_txs() == 2).await;

    builder.stop();
    builder.join().await;
    assert_eq!(metrics.counter("optimistic_proposal_worse_proposals"), 1);
    assert!(metrics.gauge("optimistic_proposal_proposals_per_height") >= 2);
    assert!(!metrics
        .points("optimistic_proposal_creation_duration")
        .is_empty());
}

#[async_std::test]
async fn failed_builds_keep_the_previous_proposal() {
    let metrics = RecordingMetrics::new();
    let builder = Arc::new(ProposalBuilder::new(5, fast_config()).with_metrics(&metrics));
    let failure = || BuildError::Error {
        message: String::from("state unavailable"),
    };
    let (_host, build) = start(
        &builder,
        ScriptedBuilder::new([Ok(4), Err(failure()), Err(failure())]),
    );

    build.exhausted().await;
    eventually(|| metrics.counter("optimistic_proposal_failed_builds") >= 2).await;

    builder.stop();
    builder.join().await;
    assert_eq!(builder.latest_proposal().num_txs(), 4);
}

#[async_std::test]
async fn failed_builds_never_release_prepare() {
    let builder = Arc::new(ProposalBuilder::new(5, fast_config()));
    start(
        &builder,
        ScriptedBuilder::new([Err(BuildError::Error {
            message: String::from("always fails"),
        })]),
    );

    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(80));
    assert!(builder.prepare_proposal_until(&ctx).await.is_none());
    assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));

    builder.stop();
    builder.join().await;
}

#[async_std::test]
async fn stop_cancels_the_build_in_progress() {
    let builder = Arc::new(ProposalBuilder::new(9, fast_config()));
    let build = Arc::new(BlockingBuilder::new());
    builder.start_background_building(
        &Context::background(),
        Arc::new(MockHost::default()),
        Arc::clone(&build),
    );

    timeout(Duration::from_secs(1), build.started())
        .await
        .expect("build never started");
    assert!(!builder.is_stopped());

    builder.stop();
    assert!(builder.is_stopped());
    timeout(Duration::from_secs(1), builder.join())
        .await
        .expect("background loop did not exit after stop");
    assert_eq!(build.observed(), vec![ContextError::Cancelled]);
}

#[async_std::test]
async fn stop_halts_rebuilding() {
    let builder = Arc::new(ProposalBuilder::new(9, fast_config()));
    let (_host, build) = start(&builder, ScriptedBuilder::counts([1]));

    eventually(|| build.builds() >= 2).await;
    builder.stop();
    builder.join().await;

    let builds = build.builds();
    task::sleep(Duration::from_millis(50)).await;
    assert_eq!(build.builds(), builds);
}

#[async_std::test]
async fn cancelling_the_parent_context_cancels_builds() {
    let builder = Arc::new(ProposalBuilder::new(9, fast_config()));
    let build = Arc::new(BlockingBuilder::new());
    let (parent, cancel) = Context::background().with_cancel();
    builder.start_background_building(&parent, Arc::new(MockHost::default()), Arc::clone(&build));

    build.started().await;
    cancel.cancel();
    eventually(|| !build.observed().is_empty()).await;
    assert_eq!(build.observed()[0], ContextError::Cancelled);

    builder.stop();
    builder.join().await;
}

#[async_std::test]
async fn requests_carry_the_height_and_byte_budget() {
    let builder = Arc::new(ProposalBuilder::new(
        11,
        ProposalBuilderConfig {
            rebuild_interval: Duration::from_millis(10),
            block_overhead_bytes: 2_000,
        },
    ));
    let host = Arc::new(MockHost::new(10_000, None));
    let build = Arc::new(ScriptedBuilder::counts([1]));
    builder.start_background_building(&Context::background(), host, Arc::clone(&build));

    eventually(|| build.builds() >= 1).await;
    builder.stop();
    builder.join().await;

    let req = build.requests()[0];
    assert_eq!(req.height, 11);
    assert_eq!(req.max_tx_bytes, 8_000);
    assert_eq!(builder.height(), 11);
}

#[async_std::test]
async fn overhead_larger_than_the_block_leaves_no_room() {
    let builder = Arc::new(ProposalBuilder::new(2, fast_config()));
    let build = Arc::new(ScriptedBuilder::counts([0]));
    builder.start_background_building(
        &Context::background(),
        Arc::new(MockHost::new(500, None)),
        Arc::clone(&build),
    );

    eventually(|| build.builds() >= 1).await;
    builder.stop();
    builder.join().await;
    assert_eq!(build.requests()[0].max_tx_bytes, 0);
}

#[test]
fn zero_rebuild_interval_falls_back_to_the_default() {
    let builder = ProposalBuilder::new(
        1,
        ProposalBuilderConfig {
            rebuild_interval: Duration::ZERO,
            block_overhead_bytes: 0,
        },
    );
    assert_eq!(
        builder.config().rebuild_interval,
        ProposalBuilderConfig::default().rebuild_interval
    );
    assert_eq!(builder.config().block_overhead_bytes, 0);
}

#[test]
fn config_reads_partial_json() {
    let config: ProposalBuilderConfig =
        serde_json::from_str(r#"{ "block_overhead_bytes": 4096 }"#).unwrap();
    assert_eq!(config.block_overhead_bytes, 4096);
    assert_eq!(
        config.rebuild_interval,
        ProposalBuilderConfig::default().rebuild_interval
    );
}

#[test]
#[should_panic(expected = "proposal builder for height 3 stopped twice")]
fn stopping_twice_panics() {
    let builder = ProposalBuilder::new(3, fast_config());
    builder.stop();
    builder.stop();
}

#[test]
#[should_panic(expected = "proposal builder for height 3 started twice")]
fn starting_twice_panics() {
    task::block_on(async {
        let builder = Arc::new(ProposalBuilder::new(3, fast_config()));
        start(&builder, ScriptedBuilder::counts([1]));
        start(&builder, ScriptedBuilder::counts([1]));
    });
}

#[async_std::test]
async fn join_without_start_returns() {
    let builder = ProposalBuilder::new(1, fast_config());
    timeout(Duration::from_millis(100), builder.join())
        .await
        .expect("join blocked on a builder that never started");
}
